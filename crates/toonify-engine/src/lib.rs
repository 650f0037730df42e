use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use toonify_contracts::models::{ModelRegistry, ModelSelector, ModelSpec, DEFAULT_IMAGE_MODEL};
use toonify_contracts::{
    GenerationError, GenerationOutput, GenerationRequest, DEFAULT_RESULT_MEDIA_TYPE,
};

mod studio;

pub use studio::{Studio, StudioUpdate};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_REQUEST_TIMEOUT_S: f64 = 90.0;
const MIN_REQUEST_TIMEOUT_S: f64 = 15.0;
const MAX_REQUEST_TIMEOUT_S: f64 = 300.0;
const DRYRUN_MAX_EDGE: u32 = 512;
const ERROR_DETAIL_MAX_CHARS: usize = 512;

#[derive(Clone)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub image_model: String,
    pub request_timeout_s: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            request_timeout_s: DEFAULT_REQUEST_TIMEOUT_S,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("image_model", &self.image_model)
            .field("request_timeout_s", &self.request_timeout_s)
            .finish()
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        Self {
            api_key: non_empty("GEMINI_API_KEY")
                .or_else(|| non_empty("GOOGLE_API_KEY"))
                .or_else(|| non_empty("API_KEY")),
            api_base: non_empty("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.api_base),
            image_model: non_empty("TOONIFY_IMAGE_MODEL").unwrap_or(defaults.image_model),
            request_timeout_s: non_empty("TOONIFY_REQUEST_TIMEOUT")
                .and_then(|value| value.parse::<f64>().ok())
                .map(clamp_timeout)
                .unwrap_or(defaults.request_timeout_s),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model.filter(|value| !value.trim().is_empty()) {
            self.image_model = model.trim().to_string();
        }
        self
    }

    pub fn with_timeout(mut self, timeout_s: Option<f64>) -> Self {
        if let Some(timeout_s) = timeout_s {
            self.request_timeout_s = clamp_timeout(timeout_s);
        }
        self
    }
}

fn clamp_timeout(value: f64) -> f64 {
    if !value.is_finite() {
        return DEFAULT_REQUEST_TIMEOUT_S;
    }
    value.clamp(MIN_REQUEST_TIMEOUT_S, MAX_REQUEST_TIMEOUT_S)
}

/// The image part a provider recovered from its reply, still base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderImage {
    pub data: String,
    pub mime_type: String,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<ProviderImage, GenerationError>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(config: &EngineConfig) -> ImageProviderRegistry {
    let mut registry = ImageProviderRegistry::new();
    registry.register(GeminiProvider::new(config));
    registry.register(DryrunProvider);
    registry
}

/// Offline stand-in: posterizes the upload and tints it from the prompt.
struct DryrunProvider;

impl DryrunProvider {
    fn tint_for_prompt(prompt: &str) -> [u8; 3] {
        let digest = Sha256::digest(prompt.as_bytes());
        [digest[0], digest[1], digest[2]]
    }

    fn posterize(channel: u8, tint: u8) -> u8 {
        let level = (channel / 64) * 64 + 32;
        ((u16::from(level) * 3 + u16::from(tint)) / 4) as u8
    }
}

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<ProviderImage, GenerationError> {
        let rejected = |detail: String| GenerationError::Rejected {
            provider: self.name().to_string(),
            status: 400,
            detail,
        };
        let bytes = BASE64
            .decode(request.image_encoding.as_bytes())
            .map_err(|err| rejected(format!("input is not base64: {err}")))?;
        let decoded = image::load_from_memory(&bytes)
            .map_err(|err| rejected(format!("input image could not be decoded: {err}")))?;
        let decoded = if decoded.width().max(decoded.height()) > DRYRUN_MAX_EDGE {
            decoded.thumbnail(DRYRUN_MAX_EDGE, DRYRUN_MAX_EDGE)
        } else {
            decoded
        };

        let tint = Self::tint_for_prompt(&request.composed_prompt);
        let mut canvas = decoded.to_rgb8();
        for pixel in canvas.pixels_mut() {
            let Rgb([r, g, b]) = *pixel;
            *pixel = Rgb([
                Self::posterize(r, tint[0]),
                Self::posterize(g, tint[1]),
                Self::posterize(b, tint[2]),
            ]);
        }

        let mut out = Cursor::new(Vec::new());
        canvas
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|err| rejected(format!("dryrun encode failed: {err}")))?;
        tracing::debug!(
            model,
            width = canvas.width(),
            height = canvas.height(),
            "dryrun image rendered"
        );
        Ok(ProviderImage {
            data: BASE64.encode(out.into_inner()),
            mime_type: "image/png".to_string(),
        })
    }
}

struct GeminiProvider {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiProvider {
    fn new(config: &EngineConfig) -> Self {
        Self {
            api_base: config.api_base.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs_f64(clamp_timeout(config.request_timeout_s)),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &GenerationRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": request.media_type.as_str(),
                            "data": request.image_encoding,
                        }
                    },
                    { "text": request.composed_prompt },
                ],
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        })
    }

    fn post(&self, endpoint: &str, api_key: &str, payload: &Value) -> Result<HttpResponse, GenerationError> {
        self.http
            .post(endpoint)
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(payload)
            .send()
            .map_err(|err| GenerationError::Transport {
                provider: "gemini".to_string(),
                detail: error_chain_text(&err.without_url(), ERROR_DETAIL_MAX_CHARS),
            })
    }

    /// Takes the first inline image part of the first candidate.
    fn extract_first_image(response_payload: &Value) -> Result<ProviderImage, GenerationError> {
        let parts = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut text_parts = Vec::new();
        for part in &parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                text_parts.push(text.trim().to_string());
            }
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim();
            if data.is_empty() {
                continue;
            }
            if BASE64.decode(data.as_bytes()).is_err() {
                tracing::warn!("skipping Gemini inline part with undecodable base64");
                continue;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_RESULT_MEDIA_TYPE)
                .to_string();
            return Ok(ProviderImage {
                data: data.to_string(),
                mime_type,
            });
        }

        let mut detail = Vec::new();
        if let Some(reason) = response_payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            detail.push(format!("blockReason={reason}"));
        }
        if let Some(reason) = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("finishReason"))
            .and_then(Value::as_str)
        {
            detail.push(format!("finishReason={reason}"));
        }
        text_parts.retain(|text| !text.is_empty());
        if !text_parts.is_empty() {
            detail.push(format!("text={}", text_parts.join(" ")));
        }
        if parts.is_empty() {
            detail.push("no candidate parts".to_string());
        }
        Err(GenerationError::NoImageReturned {
            provider: "gemini".to_string(),
            detail: truncate_text(&detail.join("; "), ERROR_DETAIL_MAX_CHARS),
        })
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<ProviderImage, GenerationError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(GenerationError::MissingCredential {
                provider: "GEMINI_API_KEY, GOOGLE_API_KEY or API_KEY".to_string(),
            });
        };
        let endpoint = self.endpoint_for_model(model);
        let payload = Self::build_payload(request);
        tracing::debug!(%endpoint, media_type = request.media_type.as_str(), "sending Gemini request");

        let response = self.post(&endpoint, api_key, &payload)?;
        let response_payload = response_json_or_error("gemini", response)?;
        Self::extract_first_image(&response_payload)
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value, GenerationError> {
    let status = response.status();
    let body = response.text().map_err(|err| GenerationError::Transport {
        provider: provider.to_string(),
        detail: error_chain_text(&err.without_url(), ERROR_DETAIL_MAX_CHARS),
    })?;
    if !status.is_success() {
        return Err(classify_http_failure(provider, status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|err| GenerationError::Rejected {
        provider: provider.to_string(),
        status: status.as_u16(),
        detail: format!("invalid JSON payload: {err}"),
    })
}

fn classify_http_failure(provider: &str, status: u16, body: &str) -> GenerationError {
    let detail = truncate_text(body.trim(), ERROR_DETAIL_MAX_CHARS);
    let invalid_key = status == 400
        && (body.contains("API_KEY_INVALID") || body.to_ascii_lowercase().contains("api key not valid"));
    match status {
        401 | 403 => GenerationError::Auth {
            provider: provider.to_string(),
            status,
            detail,
        },
        _ if invalid_key => GenerationError::Auth {
            provider: provider.to_string(),
            status,
            detail,
        },
        408 | 429 | 500..=599 => GenerationError::Transport {
            provider: provider.to_string(),
            detail: format!("HTTP {status}: {detail}"),
        },
        _ => GenerationError::Rejected {
            provider: provider.to_string(),
            status,
            detail,
        },
    }
}

/// Resolves the active model to its provider and performs single-attempt calls.
///
/// Cheap to clone: the provider table is shared.
#[derive(Clone)]
pub struct GenerationClient {
    providers: Arc<ImageProviderRegistry>,
    selector: ModelSelector,
    model: ModelSpec,
}

impl GenerationClient {
    pub fn from_config(config: &EngineConfig) -> Self {
        let selector = ModelSelector::default();
        let providers = default_provider_registry(config);
        let model = match selector.select(Some(&config.image_model)) {
            Ok(selection) => {
                if let Some(reason) = selection.fallback_reason.as_deref() {
                    tracing::warn!(reason, "image model fallback");
                }
                selection.model
            }
            Err(reason) => {
                tracing::warn!(%reason, "model registry empty; using built-in default");
                ModelSpec {
                    name: DEFAULT_IMAGE_MODEL.to_string(),
                    provider: "gemini".to_string(),
                    description: String::new(),
                }
            }
        };
        Self::with_providers(providers, selector, model)
    }

    pub fn with_providers(
        providers: ImageProviderRegistry,
        selector: ModelSelector,
        model: ModelSpec,
    ) -> Self {
        Self {
            providers: Arc::new(providers),
            selector,
            model,
        }
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.selector.registry
    }

    /// Strict switch: unknown names are an error rather than a silent fallback.
    pub fn set_model(&mut self, name: &str) -> Result<&ModelSpec, GenerationError> {
        let Some(model) = self.selector.registry.get(name).cloned() else {
            return Err(GenerationError::UnknownModel {
                model: name.trim().to_string(),
            });
        };
        self.model = model;
        Ok(&self.model)
    }

    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        let Some(provider) = self.providers.get(&self.model.provider) else {
            return Err(GenerationError::UnknownModel {
                model: self.model.name.clone(),
            });
        };
        tracing::info!(
            provider = provider.name(),
            model = %self.model.name,
            style = request.style.id(),
            "requesting cartoon"
        );
        let image = provider.generate(request, &self.model.name)?;
        Ok(GenerationOutput {
            result_encoding: image.data,
            result_media_type: image.mime_type,
            model: self.model.name.clone(),
            provider: provider.name().to_string(),
        })
    }
}

/// Short stable id for a request, safe to log in place of the image itself.
pub fn request_fingerprint(request: &GenerationRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.media_type.as_str().as_bytes());
    hasher.update(request.composed_prompt.as_bytes());
    hasher.update(request.image_encoding.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

pub fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty()
            && !parts
                .last()
                .map(|existing| existing == trimmed)
                .unwrap_or(false)
        {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};
    use toonify_contracts::{GenerationRequest, StylePreset, UploadedImage};

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut canvas = RgbImage::new(width, height);
        for (x, y, pixel) in canvas.enumerate_pixels_mut() {
            *pixel = Rgb([(x % 251) as u8, (y % 241) as u8, 90]);
        }
        let mut out = Cursor::new(Vec::new());
        canvas
            .write_to(&mut out, ImageFormat::Png)
            .expect("png fixture");
        out.into_inner()
    }

    pub(crate) fn request_for_test(style: StylePreset) -> GenerationRequest {
        let image = UploadedImage::from_bytes(png_bytes(24, 16), None).expect("fixture decodes");
        GenerationRequest::new(&image, style)
    }
}
