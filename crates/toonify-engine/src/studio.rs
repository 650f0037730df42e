//! Drives a [`Session`] with generation calls running off the caller's thread.
//!
//! The session is only ever touched from the owning thread. Workers send their
//! outcome back over a channel, and `poll`/`wait` apply it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use toonify_contracts::events::{EventWriter, SessionEvent};
use toonify_contracts::export::{export_result, ExportedResult};
use toonify_contracts::models::ModelSpec;
use toonify_contracts::{
    AttemptId, Completion, DecodeError, GenerationError, GenerationOutput, Session, SessionPhase,
    SessionState, StylePreset, UploadedImage,
};

use crate::{request_fingerprint, GenerationClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudioUpdate {
    Resolved {
        attempt: AttemptId,
        phase: SessionPhase,
    },
    Superseded {
        attempt: AttemptId,
    },
}

struct WorkerCompletion {
    attempt: AttemptId,
    outcome: Result<GenerationOutput, GenerationError>,
    latency_ms: u64,
}

pub struct Studio {
    session: Session,
    client: GenerationClient,
    events: Option<EventWriter>,
    sender: mpsc::Sender<WorkerCompletion>,
    receiver: mpsc::Receiver<WorkerCompletion>,
    outstanding: usize,
}

impl Studio {
    pub fn new(client: GenerationClient, events: Option<EventWriter>, style: StylePreset) -> Self {
        let (sender, receiver) = mpsc::channel();
        let studio = Self {
            session: Session::new(style),
            client,
            events,
            sender,
            receiver,
            outstanding: 0,
        };
        studio.emit(SessionEvent::SessionStarted {
            model: studio.client.model().name.clone(),
            style,
        });
        studio
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> &SessionState {
        self.session.state()
    }

    pub fn model(&self) -> &ModelSpec {
        self.client.model()
    }

    pub fn client(&self) -> &GenerationClient {
        &self.client
    }

    /// Applies to the next attempt; one already in flight keeps its model.
    pub fn set_model(&mut self, name: &str) -> Result<&ModelSpec, GenerationError> {
        self.client.set_model(name)
    }

    pub fn set_style(&mut self, style: StylePreset) {
        if self.session.style() == style {
            return;
        }
        self.session.set_style(style);
        self.emit(SessionEvent::StyleChanged { style });
    }

    pub fn select_file(&mut self, path: &Path) -> Result<(), DecodeError> {
        let source = Some(path.to_string_lossy().to_string());
        match UploadedImage::from_path(path) {
            Ok(image) => {
                self.accept_image(image, source);
                Ok(())
            }
            Err(err) => {
                self.reject_image(source, &err);
                Err(err)
            }
        }
    }

    pub fn select_bytes(&mut self, bytes: Vec<u8>, declared: Option<&str>) -> Result<(), DecodeError> {
        match UploadedImage::from_bytes(bytes, declared) {
            Ok(image) => {
                self.accept_image(image, None);
                Ok(())
            }
            Err(err) => {
                self.reject_image(None, &err);
                Err(err)
            }
        }
    }

    pub fn clear_image(&mut self) {
        let abandoned = self.session.clear_image();
        self.note_abandoned(abandoned);
        self.emit(SessionEvent::ImageCleared);
    }

    /// Starts an attempt on a worker thread. `None` when no image is selected
    /// or an attempt is already in flight.
    pub fn trigger(&mut self) -> Option<AttemptId> {
        let ticket = self.session.begin_generation()?;
        let attempt = ticket.attempt;
        self.emit(SessionEvent::GenerationStarted {
            attempt: attempt.get(),
            style: ticket.request.style,
            model: self.client.model().name.clone(),
            request_fingerprint: request_fingerprint(&ticket.request),
        });

        let client = self.client.clone();
        let sender = self.sender.clone();
        let spawned = thread::Builder::new()
            .name("toonify-generate".to_string())
            .spawn(move || {
                let started = Instant::now();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    client.generate(&ticket.request)
                }))
                .unwrap_or_else(|payload| {
                    Err(GenerationError::Transport {
                        provider: client.model().provider.clone(),
                        detail: format!("provider panicked: {}", panic_text(payload.as_ref())),
                    })
                });
                let latency_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
                let _ = sender.send(WorkerCompletion {
                    attempt: ticket.attempt,
                    outcome,
                    latency_ms,
                });
            });

        match spawned {
            Ok(_) => self.outstanding += 1,
            Err(err) => {
                self.apply(WorkerCompletion {
                    attempt,
                    outcome: Err(GenerationError::Transport {
                        provider: self.client.model().provider.clone(),
                        detail: format!("generation thread spawn failed: {err}"),
                    }),
                    latency_ms: 0,
                });
            }
        }
        Some(attempt)
    }

    /// Applies every completion that has already arrived without blocking.
    pub fn poll(&mut self) -> Vec<StudioUpdate> {
        let mut updates = Vec::new();
        while let Ok(completion) = self.receiver.try_recv() {
            self.outstanding = self.outstanding.saturating_sub(1);
            updates.push(self.apply(completion));
        }
        updates
    }

    /// Blocks until the attempt currently in flight resolves.
    pub fn wait(&mut self) -> Option<StudioUpdate> {
        let current = self.session.state().in_flight()?;
        while let Ok(completion) = self.receiver.recv() {
            self.outstanding = self.outstanding.saturating_sub(1);
            let attempt = completion.attempt;
            let update = self.apply(completion);
            if attempt == current {
                return Some(update);
            }
        }
        None
    }

    /// Blocks until every spawned worker, superseded ones included, has reported.
    pub fn settle(&mut self) -> Vec<StudioUpdate> {
        let mut updates = Vec::new();
        while self.outstanding > 0 {
            let Ok(completion) = self.receiver.recv() else {
                break;
            };
            self.outstanding -= 1;
            updates.push(self.apply(completion));
        }
        updates
    }

    pub fn export(&mut self, destination: &Path) -> anyhow::Result<ExportedResult> {
        let Some(result) = self.session.state().result() else {
            anyhow::bail!("No generated image to save yet.");
        };
        let exported = export_result(result, destination)?;
        self.emit(SessionEvent::ResultExported {
            image_path: exported.image_path.to_string_lossy().to_string(),
            receipt_path: exported.receipt_path.to_string_lossy().to_string(),
        });
        Ok(exported)
    }

    fn accept_image(&mut self, image: UploadedImage, source: Option<String>) {
        let media_type = image.media_type().as_str().to_string();
        let bytes = image.raw_bytes().len();
        let abandoned = self.session.select_image(image);
        self.note_abandoned(abandoned);
        self.emit(SessionEvent::ImageSelected {
            media_type,
            bytes,
            source,
        });
    }

    fn reject_image(&self, source: Option<String>, err: &DecodeError) {
        tracing::info!(error = %err, "image rejected");
        self.emit(SessionEvent::ImageRejected {
            source,
            reason: err.to_string(),
        });
    }

    fn note_abandoned(&self, abandoned: Option<AttemptId>) {
        if let Some(attempt) = abandoned {
            tracing::info!(%attempt, "in-flight attempt superseded");
            self.emit(SessionEvent::GenerationSuperseded {
                attempt: attempt.get(),
            });
        }
    }

    fn apply(&mut self, completion: WorkerCompletion) -> StudioUpdate {
        let WorkerCompletion {
            attempt,
            outcome,
            latency_ms,
        } = completion;
        let event = match &outcome {
            Ok(output) => SessionEvent::GenerationSucceeded {
                attempt: attempt.get(),
                media_type: output.result_media_type.clone(),
                latency_ms,
            },
            Err(err) => SessionEvent::GenerationFailed {
                attempt: attempt.get(),
                kind: err.kind().as_str().to_string(),
                detail: err.to_string(),
                latency_ms,
            },
        };

        match self.session.complete(attempt, outcome) {
            Completion::Applied(phase) => {
                self.emit(event);
                StudioUpdate::Resolved { attempt, phase }
            }
            Completion::Superseded => StudioUpdate::Superseded { attempt },
        }
    }

    fn emit(&self, event: SessionEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(&event) {
            tracing::warn!(error = %err, path = %events.path().display(), "failed to write session event");
        }
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use indexmap::IndexMap;
    use serde_json::Value;
    use toonify_contracts::models::{ModelRegistry, ModelSelector};
    use toonify_contracts::{GenerationErrorKind, GenerationRequest, GENERATION_FAILED_MESSAGE};

    use super::*;
    use crate::test_support::png_bytes;
    use crate::{EngineConfig, ImageProvider, ImageProviderRegistry, ProviderImage};

    /// Replies with a fixed outcome; optionally blocks until released.
    struct ScriptedProvider {
        calls: Arc<AtomicUsize>,
        gate: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
        reply: Result<ProviderImage, GenerationError>,
    }

    impl ImageProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(
            &self,
            _request: &GenerationRequest,
            _model: &str,
        ) -> Result<ProviderImage, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.gate.as_ref() {
                if let Ok(gate) = gate.lock() {
                    let _ = gate.recv();
                }
            }
            self.reply.clone()
        }
    }

    struct Harness {
        studio: Studio,
        calls: Arc<AtomicUsize>,
        release: Option<mpsc::Sender<()>>,
        events_path: std::path::PathBuf,
        _temp: tempfile::TempDir,
    }

    fn harness(reply: Result<ProviderImage, GenerationError>, gated: bool) -> anyhow::Result<Harness> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = if gated {
            let (tx, rx) = mpsc::channel();
            (Some(tx), Some(Arc::new(Mutex::new(rx))))
        } else {
            (None, None)
        };

        let mut providers = ImageProviderRegistry::new();
        providers.register(ScriptedProvider {
            calls: Arc::clone(&calls),
            gate,
            reply,
        });
        let model = ModelSpec {
            name: "scripted-image".to_string(),
            provider: "scripted".to_string(),
            description: "test double".to_string(),
        };
        let mut models = IndexMap::new();
        models.insert(model.name.clone(), model.clone());
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(models))));
        let client = GenerationClient::with_providers(providers, selector, model);

        let studio = Studio::new(
            client,
            Some(EventWriter::new(&events_path, "test-session")),
            StylePreset::DEFAULT,
        );
        Ok(Harness {
            studio,
            calls,
            release,
            events_path,
            _temp: temp,
        })
    }

    fn png_reply() -> Result<ProviderImage, GenerationError> {
        Ok(ProviderImage {
            data: BASE64.encode(png_bytes(8, 8)),
            mime_type: "image/png".to_string(),
        })
    }

    fn event_types(path: &Path) -> anyhow::Result<Vec<String>> {
        let content = fs::read_to_string(path)?;
        let mut types = Vec::new();
        for line in content.lines() {
            let row: Value = serde_json::from_str(line)?;
            types.push(row["type"].as_str().unwrap_or_default().to_string());
        }
        Ok(types)
    }

    #[test]
    fn anime_attempt_resolves_to_png_result() -> anyhow::Result<()> {
        let mut h = harness(png_reply(), false)?;
        h.studio.select_bytes(png_bytes(500, 500), Some("image/png"))?;
        h.studio.set_style(StylePreset::Anime);

        let attempt = h.studio.trigger().expect("admitted");
        let update = h.studio.wait().expect("in flight");
        assert_eq!(
            update,
            StudioUpdate::Resolved {
                attempt,
                phase: SessionPhase::Succeeded
            }
        );
        let result = h.studio.state().result().expect("result");
        assert_eq!(result.result_media_type, "image/png");
        assert_eq!(result.style_preset_used, StylePreset::Anime);
        assert_eq!(result.provider, "scripted");

        assert_eq!(
            event_types(&h.events_path)?,
            vec![
                "session_started",
                "image_selected",
                "style_changed",
                "generation_started",
                "generation_succeeded"
            ]
        );
        Ok(())
    }

    #[test]
    fn second_trigger_while_generating_sends_nothing() -> anyhow::Result<()> {
        let mut h = harness(png_reply(), true)?;
        h.studio.select_bytes(png_bytes(32, 32), None)?;

        let first = h.studio.trigger();
        assert!(first.is_some());
        assert_eq!(h.studio.trigger(), None);
        assert_eq!(h.studio.trigger(), None);

        if let Some(release) = h.release.take() {
            release.send(())?;
        }
        h.studio.wait();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.studio.session().phase(), SessionPhase::Succeeded);
        Ok(())
    }

    #[test]
    fn text_only_reply_surfaces_generic_failure() -> anyhow::Result<()> {
        let mut h = harness(
            Err(GenerationError::NoImageReturned {
                provider: "scripted".to_string(),
                detail: "text=Sorry, I can't do that".to_string(),
            }),
            false,
        )?;
        h.studio.select_bytes(png_bytes(16, 16), None)?;
        h.studio.trigger();
        h.studio.wait();

        match h.studio.state() {
            SessionState::Failed { message, kind, .. } => {
                assert_eq!(message, GENERATION_FAILED_MESSAGE);
                assert_eq!(*kind, GenerationErrorKind::NoImageReturned);
            }
            other => panic!("unexpected state {other:?}"),
        }

        let content = fs::read_to_string(&h.events_path)?;
        let failed: Value = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .find(|row| row["type"] == "generation_failed")
            .expect("failure event");
        assert_eq!(failed["kind"], "no_image_returned");
        assert!(failed["detail"].as_str().unwrap_or_default().contains("Sorry"));
        Ok(())
    }

    #[test]
    fn new_image_mid_flight_discards_stale_result() -> anyhow::Result<()> {
        let mut h = harness(png_reply(), true)?;
        h.studio.select_bytes(png_bytes(20, 20), None)?;
        let stale = h.studio.trigger().expect("admitted");

        h.studio.select_bytes(png_bytes(40, 30), None)?;
        assert_eq!(h.studio.session().phase(), SessionPhase::ImageSelected);

        if let Some(release) = h.release.take() {
            release.send(())?;
        }
        let updates = h.studio.settle();
        assert_eq!(updates, vec![StudioUpdate::Superseded { attempt: stale }]);
        assert_eq!(h.studio.session().phase(), SessionPhase::ImageSelected);
        assert!(h.studio.state().result().is_none());

        let types = event_types(&h.events_path)?;
        assert!(types.contains(&"generation_superseded".to_string()));
        assert!(!types.contains(&"generation_succeeded".to_string()));
        Ok(())
    }

    #[test]
    fn clear_mid_flight_returns_to_idle() -> anyhow::Result<()> {
        let mut h = harness(png_reply(), true)?;
        h.studio.select_bytes(png_bytes(20, 20), None)?;
        h.studio.trigger();
        h.studio.clear_image();

        if let Some(release) = h.release.take() {
            release.send(())?;
        }
        h.studio.settle();
        assert_eq!(h.studio.session().phase(), SessionPhase::Idle);
        assert_eq!(h.studio.wait(), None);
        Ok(())
    }

    struct PanickingProvider;

    impl ImageProvider for PanickingProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(
            &self,
            _request: &GenerationRequest,
            _model: &str,
        ) -> Result<ProviderImage, GenerationError> {
            panic!("provider blew up");
        }
    }

    #[test]
    fn provider_panic_resolves_as_transport_failure() -> anyhow::Result<()> {
        let mut providers = ImageProviderRegistry::new();
        providers.register(PanickingProvider);
        let model = ModelSpec {
            name: "scripted-image".to_string(),
            provider: "scripted".to_string(),
            description: String::new(),
        };
        let mut models = IndexMap::new();
        models.insert(model.name.clone(), model.clone());
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(models))));
        let client = GenerationClient::with_providers(providers, selector, model);
        let mut studio = Studio::new(client, None, StylePreset::DEFAULT);

        studio.select_bytes(png_bytes(12, 12), None)?;
        let attempt = studio.trigger().expect("admitted");
        assert_eq!(
            studio.wait(),
            Some(StudioUpdate::Resolved {
                attempt,
                phase: SessionPhase::Failed
            })
        );
        match studio.state() {
            SessionState::Failed { message, kind, .. } => {
                assert_eq!(message, GENERATION_FAILED_MESSAGE);
                assert_eq!(*kind, GenerationErrorKind::Transport);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(studio.settle().is_empty());

        studio.trigger();
        assert!(studio.wait().is_some());
        Ok(())
    }

    #[test]
    fn rejected_upload_keeps_previous_image() -> anyhow::Result<()> {
        let mut h = harness(png_reply(), false)?;
        h.studio.select_bytes(png_bytes(10, 10), None)?;
        assert!(h.studio.select_bytes(b"plain text".to_vec(), None).is_err());
        assert_eq!(h.studio.session().phase(), SessionPhase::ImageSelected);
        assert!(event_types(&h.events_path)?.contains(&"image_rejected".to_string()));
        Ok(())
    }

    #[test]
    fn restyle_with_dryrun_replaces_result_and_exports() -> anyhow::Result<()> {
        let client = GenerationClient::from_config(
            &EngineConfig::default().with_model(Some("dryrun-image-1".to_string())),
        );
        let mut studio = Studio::new(client, None, StylePreset::Pixar3d);
        studio.select_bytes(png_bytes(640, 480), None)?;

        studio.trigger();
        studio.wait();
        let first = studio.state().result().cloned().expect("first result");
        assert_eq!(first.style_preset_used, StylePreset::Pixar3d);

        studio.set_style(StylePreset::ComicBook);
        studio.trigger();
        assert!(studio.state().result().is_none());
        assert_eq!(studio.session().phase(), SessionPhase::Generating);
        studio.wait();

        let second = studio.state().result().cloned().expect("second result");
        assert_eq!(second.style_preset_used, StylePreset::ComicBook);
        assert_ne!(first.result_encoding, second.result_encoding);

        let temp = tempfile::tempdir()?;
        let exported = studio.export(temp.path())?;
        let saved = image::open(&exported.image_path)?;
        assert!(saved.width() <= 512 && saved.height() <= 512);
        Ok(())
    }

    #[test]
    fn export_without_result_is_an_error() -> anyhow::Result<()> {
        let mut h = harness(png_reply(), false)?;
        let temp = tempfile::tempdir()?;
        assert!(h.studio.export(temp.path()).is_err());
        Ok(())
    }
}
