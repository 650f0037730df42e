use thiserror::Error;

/// Shown for every generation-time failure. The underlying cause is only logged.
pub const GENERATION_FAILED_MESSAGE: &str =
    "Failed to generate cartoon. Please try a different image or try again later.";

/// Shown when a selected file cannot be turned into an uploadable image.
pub const DECODE_FAILED_MESSAGE: &str =
    "Could not read file. Please choose a JPEG, PNG, WEBP or GIF image.";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("image file is empty")]
    Empty,
    #[error("bytes are not a recognized image container")]
    Unrecognized,
    #[error("unsupported image format: {0}")]
    Unsupported(String),
    #[error("{media_type} image data is corrupt or truncated: {detail}")]
    Corrupt {
        media_type: &'static str,
        detail: String,
    },
    #[error("malformed data url: {0}")]
    MalformedDataUrl(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("failed reading image file: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    pub fn user_message(&self) -> &'static str {
        DECODE_FAILED_MESSAGE
    }
}

/// Coarse failure classes a generation attempt can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    Auth,
    Transport,
    Rejected,
    NoImageReturned,
    Configuration,
}

impl GenerationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Transport => "transport",
            Self::Rejected => "rejected",
            Self::NoImageReturned => "no_image_returned",
            Self::Configuration => "configuration",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("no API key configured for {provider}")]
    MissingCredential { provider: String },
    #[error("{provider} rejected the credential ({status}): {detail}")]
    Auth {
        provider: String,
        status: u16,
        detail: String,
    },
    #[error("{provider} request did not complete: {detail}")]
    Transport { provider: String, detail: String },
    #[error("{provider} request failed ({status}): {detail}")]
    Rejected {
        provider: String,
        status: u16,
        detail: String,
    },
    #[error("{provider} returned no image: {detail}")]
    NoImageReturned { provider: String, detail: String },
    #[error("unknown image model '{model}'")]
    UnknownModel { model: String },
}

impl GenerationError {
    pub fn kind(&self) -> GenerationErrorKind {
        match self {
            Self::MissingCredential { .. } | Self::Auth { .. } => GenerationErrorKind::Auth,
            Self::Transport { .. } => GenerationErrorKind::Transport,
            Self::Rejected { .. } => GenerationErrorKind::Rejected,
            Self::NoImageReturned { .. } => GenerationErrorKind::NoImageReturned,
            Self::UnknownModel { .. } => GenerationErrorKind::Configuration,
        }
    }

    pub fn user_message(&self) -> &'static str {
        GENERATION_FAILED_MESSAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_generation_failure_collapses_to_one_message() {
        let errors = [
            GenerationError::MissingCredential {
                provider: "gemini".to_string(),
            },
            GenerationError::Auth {
                provider: "gemini".to_string(),
                status: 403,
                detail: "PERMISSION_DENIED".to_string(),
            },
            GenerationError::Transport {
                provider: "gemini".to_string(),
                detail: "connection reset".to_string(),
            },
            GenerationError::NoImageReturned {
                provider: "gemini".to_string(),
                detail: "text only".to_string(),
            },
        ];
        for err in &errors {
            assert_eq!(err.user_message(), GENERATION_FAILED_MESSAGE);
            assert!(!err.user_message().contains(&err.to_string()));
        }
        assert_eq!(errors[0].kind(), GenerationErrorKind::Auth);
        assert_eq!(errors[1].kind(), GenerationErrorKind::Auth);
        assert_eq!(errors[2].kind(), GenerationErrorKind::Transport);
        assert_eq!(errors[3].kind(), GenerationErrorKind::NoImageReturned);
    }

    #[test]
    fn decode_message_differs_from_generation_message() {
        assert_ne!(DecodeError::Unrecognized.user_message(), GENERATION_FAILED_MESSAGE);
    }
}
