//! Error taxonomy for OCR sessions.

use thiserror::Error;

use crate::backend::BackendError;

/// Which prefill phase of a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefillStage {
    SystemPrompt,
    ImageEmbed,
    UserPrompt,
    /// Replay of a freshly sampled token.
    Generated,
}

impl std::fmt::Display for PrefillStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PrefillStage::SystemPrompt => "system prompt",
            PrefillStage::ImageEmbed => "image embedding",
            PrefillStage::UserPrompt => "user prompt",
            PrefillStage::Generated => "generated token",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("model load failed: {0}")]
    ModelLoad(#[source] BackendError),

    #[error("invalid OCR mode {0} (expected 1..=4)")]
    InvalidMode(i32),

    #[error("prefill of {stage} failed at n_past {n_past}: {source}")]
    Prefill {
        stage: PrefillStage,
        n_past: usize,
        #[source]
        source: BackendError,
    },

    #[error("could not init sampler: {0}")]
    SamplerInit(#[source] BackendError),

    #[error("prompt has no base64 image tag")]
    MissingImageTag,

    #[error("invalid base64 image payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("session already destroyed")]
    AlreadyDestroyed,

    #[error("operation not valid while session is {0:?}")]
    InvalidState(crate::session::SessionState),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T, E = OcrError> = std::result::Result<T, E>;
