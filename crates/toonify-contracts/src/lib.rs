pub mod chat;
pub mod codec;
pub mod error;
pub mod events;
pub mod export;
pub mod generation;
pub mod models;
pub mod session;
pub mod styles;

pub use codec::{MediaType, UploadedImage};
pub use error::{
    DecodeError, GenerationError, GenerationErrorKind, DECODE_FAILED_MESSAGE,
    GENERATION_FAILED_MESSAGE,
};
pub use generation::{
    compose_prompt, GenerationOutput, GenerationRequest, GenerationResult,
    DEFAULT_RESULT_MEDIA_TYPE,
};
pub use session::{
    AttemptId, Completion, GenerationTicket, Session, SessionPhase, SessionState,
};
pub use styles::{instruction_for, StylePreset, FALLBACK_INSTRUCTION};
