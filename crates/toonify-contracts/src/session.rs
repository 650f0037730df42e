//! Lifecycle of one user's cartoon generation session.
//!
//! The whole session is a single [`SessionState`] value, so combinations such as
//! "generating while still showing an old result" cannot be expressed. Every
//! attempt carries an [`AttemptId`]; a completion only lands if its attempt is
//! still the one in flight.

use std::fmt;
use std::path::Path;

use crate::codec::UploadedImage;
use crate::error::{DecodeError, GenerationError, GenerationErrorKind};
use crate::generation::{GenerationOutput, GenerationRequest, GenerationResult};
use crate::styles::StylePreset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ImageSelected {
        image: UploadedImage,
    },
    Generating {
        image: UploadedImage,
        attempt: AttemptId,
        request: GenerationRequest,
    },
    Succeeded {
        image: UploadedImage,
        result: GenerationResult,
    },
    Failed {
        image: UploadedImage,
        message: String,
        kind: GenerationErrorKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    ImageSelected,
    Generating,
    Succeeded,
    Failed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ImageSelected => "image_selected",
            Self::Generating => "generating",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            Self::Idle => SessionPhase::Idle,
            Self::ImageSelected { .. } => SessionPhase::ImageSelected,
            Self::Generating { .. } => SessionPhase::Generating,
            Self::Succeeded { .. } => SessionPhase::Succeeded,
            Self::Failed { .. } => SessionPhase::Failed,
        }
    }

    pub fn image(&self) -> Option<&UploadedImage> {
        match self {
            Self::Idle => None,
            Self::ImageSelected { image }
            | Self::Generating { image, .. }
            | Self::Succeeded { image, .. }
            | Self::Failed { image, .. } => Some(image),
        }
    }

    pub fn result(&self) -> Option<&GenerationResult> {
        match self {
            Self::Succeeded { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Failed { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }

    pub fn in_flight(&self) -> Option<AttemptId> {
        match self {
            Self::Generating { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }
}

/// Handed to whoever performs the outbound call for an admitted attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationTicket {
    pub attempt: AttemptId,
    pub request: GenerationRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Applied(SessionPhase),
    /// The attempt was replaced or abandoned before it resolved.
    Superseded,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    style: StylePreset,
    attempts: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(StylePreset::DEFAULT)
    }
}

impl Session {
    pub fn new(style: StylePreset) -> Self {
        Self {
            state: SessionState::Idle,
            style,
            attempts: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    pub fn style(&self) -> StylePreset {
        self.style
    }

    /// Only affects the next attempt's prompt.
    pub fn set_style(&mut self, style: StylePreset) {
        self.style = style;
    }

    /// Replaces any prior image (and any result or error tied to it).
    /// Returns the attempt that was abandoned, if one was in flight.
    pub fn select_image(&mut self, image: UploadedImage) -> Option<AttemptId> {
        let abandoned = self.state.in_flight();
        self.state = SessionState::ImageSelected { image };
        abandoned
    }

    /// On decode failure the state is left untouched.
    pub fn select_bytes(
        &mut self,
        bytes: Vec<u8>,
        declared: Option<&str>,
    ) -> Result<Option<AttemptId>, DecodeError> {
        let image = UploadedImage::from_bytes(bytes, declared)?;
        Ok(self.select_image(image))
    }

    pub fn select_file(&mut self, path: &Path) -> Result<Option<AttemptId>, DecodeError> {
        let image = UploadedImage::from_path(path)?;
        Ok(self.select_image(image))
    }

    pub fn clear_image(&mut self) -> Option<AttemptId> {
        let abandoned = self.state.in_flight();
        self.state = SessionState::Idle;
        abandoned
    }

    /// Admits a new attempt unless no image is selected or one is already in flight.
    /// Any previous result or error is dropped here, not when the attempt resolves.
    pub fn begin_generation(&mut self) -> Option<GenerationTicket> {
        let image = match &self.state {
            SessionState::Idle | SessionState::Generating { .. } => return None,
            SessionState::ImageSelected { image }
            | SessionState::Succeeded { image, .. }
            | SessionState::Failed { image, .. } => image.clone(),
        };

        self.attempts += 1;
        let attempt = AttemptId(self.attempts);
        let request = GenerationRequest::new(&image, self.style);
        self.state = SessionState::Generating {
            image,
            attempt,
            request: request.clone(),
        };
        Some(GenerationTicket { attempt, request })
    }

    pub fn complete(
        &mut self,
        attempt: AttemptId,
        outcome: Result<GenerationOutput, GenerationError>,
    ) -> Completion {
        if self.state.in_flight() != Some(attempt) {
            tracing::debug!(%attempt, "dropping completion for superseded attempt");
            return Completion::Superseded;
        }
        let SessionState::Generating { image, request, .. } =
            std::mem::replace(&mut self.state, SessionState::Idle)
        else {
            return Completion::Superseded;
        };

        self.state = match outcome {
            Ok(output) => SessionState::Succeeded {
                image,
                result: GenerationResult::from_output(
                    output,
                    request.style,
                    request.composed_prompt,
                ),
            },
            Err(err) => {
                tracing::warn!(%attempt, kind = err.kind().as_str(), error = %err, "generation failed");
                SessionState::Failed {
                    image,
                    message: err.user_message().to_string(),
                    kind: err.kind(),
                }
            }
        };
        Completion::Applied(self.state.phase())
    }
}
