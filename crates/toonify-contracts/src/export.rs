use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{Map, Value};

use crate::codec::{media_type_for_path, MediaType};
use crate::events::now_utc_iso;
use crate::generation::GenerationResult;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

pub fn extension_for_media_type(media_type: &str) -> &'static str {
    MediaType::parse(media_type)
        .map(MediaType::extension)
        .unwrap_or("png")
}

/// `toonified-<timestamp>.<ext>`
pub fn suggested_filename(media_type: &str, timestamp_ms: i64) -> String {
    format!(
        "toonified-{timestamp_ms}.{}",
        extension_for_media_type(media_type)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedResult {
    pub image_path: PathBuf,
    pub receipt_path: PathBuf,
}

/// Writes the decoded result plus a `<file>.json` receipt.
///
/// A directory destination (existing, or spelled with a trailing separator)
/// receives the suggested file name. A file destination keeps its name but
/// takes the extension of the result's media type.
pub fn export_result(result: &GenerationResult, destination: &Path) -> anyhow::Result<ExportedResult> {
    let image_path = if destination.is_dir() || ends_with_separator(destination) {
        destination.join(suggested_filename(
            &result.result_media_type,
            chrono::Utc::now().timestamp_millis(),
        ))
    } else {
        with_matching_extension(destination, result.media_type())
    };
    let bytes = result
        .decode_bytes()
        .context("generated image payload is not valid base64")?;

    if let Some(parent) = image_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&image_path, &bytes)
        .with_context(|| format!("failed to write {}", image_path.display()))?;

    let receipt_path = receipt_path_for(&image_path);
    let receipt = build_receipt(result, &image_path, bytes.len());
    write_receipt(&receipt_path, &receipt)?;

    Ok(ExportedResult {
        image_path,
        receipt_path,
    })
}

pub fn build_receipt(result: &GenerationResult, image_path: &Path, byte_count: usize) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "style".to_string(),
        Value::String(result.style_preset_used.id().to_string()),
    );
    root.insert(
        "style_label".to_string(),
        Value::String(result.style_preset_used.label().to_string()),
    );
    root.insert("model".to_string(), Value::String(result.model.clone()));
    root.insert(
        "provider".to_string(),
        Value::String(result.provider.clone()),
    );
    root.insert(
        "media_type".to_string(),
        Value::String(result.result_media_type.clone()),
    );
    root.insert("prompt".to_string(), Value::String(result.prompt.clone()));
    root.insert("bytes".to_string(), Value::Number(byte_count.into()));
    root.insert(
        "image_path".to_string(),
        Value::String(image_path.to_string_lossy().to_string()),
    );
    root.insert("exported_at".to_string(), Value::String(now_utc_iso()));
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn with_matching_extension(destination: &Path, media_type: Option<MediaType>) -> PathBuf {
    let Some(media_type) = media_type else {
        return destination.to_path_buf();
    };
    if media_type_for_path(destination) == Some(media_type) {
        return destination.to_path_buf();
    }
    let adjusted = destination.with_extension(media_type.extension());
    tracing::warn!(
        requested = %destination.display(),
        written = %adjusted.display(),
        media_type = media_type.as_str(),
        "export extension does not match result media type"
    );
    adjusted
}

fn receipt_path_for(image_path: &Path) -> PathBuf {
    let mut raw = image_path.as_os_str().to_owned();
    raw.push(".json");
    PathBuf::from(raw)
}

fn ends_with_separator(path: &Path) -> bool {
    path.as_os_str()
        .to_string_lossy()
        .ends_with(std::path::MAIN_SEPARATOR)
}
