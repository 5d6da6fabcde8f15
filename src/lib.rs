//! got-ocr: GOT-OCR decoder runtime on llama.cpp.
//!
//! Feeds precomputed image embeddings through a GGUF decoder between an
//! OCR system prompt and a mode-specific user prompt, then samples the
//! recognized text. The `ffi` module exposes the same session as a C ABI.

pub mod backend;
pub mod config;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod output;
pub mod prefill;
pub mod prompt;
pub mod sampler;
pub mod session;

pub use backend::{BackendError, DecodeBackend, ImageEmbed, SamplingParams, TokenId, VisionEncoder, EMBED_DIM};
pub use config::OcrConfig;
pub use error::{OcrError, PrefillStage};
pub use output::OcrOutput;
pub use prompt::OcrMode;
pub use session::{OcrSession, RunStats, SessionState, StopReason};
