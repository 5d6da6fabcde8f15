//! Decoder backend trait and implementations.
//!
//! The backend trait is the cutpoint between the OCR session logic and the
//! actual model inference. The session only ever talks to a `DecodeBackend`;
//! llama.cpp is one implementation, the scripted test backend is another.

pub mod llama_cpp;

#[cfg(test)]
pub(crate) mod scripted;

use crate::config::OcrConfig;
use thiserror::Error;

/// Width of every image embedding vector fed to the decoder.
pub const EMBED_DIM: usize = 1024;

/// A vocabulary token id, as understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(pub i32);

/// Errors from decoder backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("failed to create decode context: {0}")]
    Context(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("decode failed with status {status} ({n_items} items)")]
    Decode { status: i32, n_items: usize },

    #[error("sampler error: {0}")]
    Sampler(String),

    #[error("vision encoder error: {0}")]
    Vision(String),
}

/// Sampling parameters handed to `DecodeBackend::new_sampler`.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Temperature. Zero or negative selects greedy decoding.
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub repeat_last_n: i32,
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            seed: u32::MAX,
        }
    }
}

impl SamplingParams {
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// A block of image embeddings: `n_pos` vectors of `EMBED_DIM` floats each.
///
/// The session always works on its own copy, so the caller's buffer can be
/// reused or dropped as soon as `run` is entered.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEmbed {
    data: Vec<f32>,
    n_pos: usize,
}

impl ImageEmbed {
    /// Take ownership of a flat `n_pos * EMBED_DIM` buffer.
    pub fn new(data: Vec<f32>, n_pos: usize) -> Result<Self, crate::OcrError> {
        if data.len() != n_pos * EMBED_DIM {
            return Err(crate::OcrError::Argument(format!(
                "embedding block has {} floats, expected {} ({} x {})",
                data.len(),
                n_pos * EMBED_DIM,
                n_pos,
                EMBED_DIM
            )));
        }
        Ok(Self { data, n_pos })
    }

    /// Copy a caller-owned flat buffer. The length must be a multiple of `EMBED_DIM`.
    pub fn from_slice(data: &[f32]) -> Result<Self, crate::OcrError> {
        if data.len() % EMBED_DIM != 0 {
            return Err(crate::OcrError::Argument(format!(
                "embedding block length {} is not a multiple of {}",
                data.len(),
                EMBED_DIM
            )));
        }
        Self::new(data.to_vec(), data.len() / EMBED_DIM)
    }

    /// Number of image positions (vectors) in the block.
    pub fn n_pos(&self) -> usize {
        self.n_pos
    }

    pub fn dim(&self) -> usize {
        EMBED_DIM
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// The contract between the OCR session and a loaded decoder.
///
/// One value owns a model handle plus exactly one decode context. The
/// context accumulates causal history until `reset_context` replaces it.
pub trait DecodeBackend {
    /// Opaque sampler state created per run.
    type Sampler;

    /// Load the model and build the initial decode context.
    ///
    /// Implementations must release everything they acquired when any step fails.
    fn load(config: &OcrConfig) -> Result<Self, BackendError>
    where
        Self: Sized;

    /// Decode one batch of discrete tokens at the next positions.
    fn decode_tokens(&mut self, tokens: &[TokenId]) -> Result<(), BackendError>;

    /// Decode `n_items` embedding vectors laid out contiguously in `embd`.
    fn decode_embeddings(&mut self, embd: &[f32], n_items: usize) -> Result<(), BackendError>;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError>;

    /// Display bytes for one token. May be an incomplete UTF-8 sequence.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;

    /// Whether the token ends generation (EOS, EOT, ...).
    fn is_eog(&self, token: TokenId) -> bool;

    /// Embedding width the model expects.
    fn n_embd(&self) -> usize;

    fn new_sampler(&self, params: &SamplingParams) -> Result<Self::Sampler, BackendError>;

    /// Sample from the logits of the last decoded position. Must not accept
    /// the token; the caller does that through `accept`.
    fn sample(&mut self, sampler: &mut Self::Sampler) -> Result<TokenId, BackendError>;

    /// Record a token as accepted so stateful samplers (penalties) see it.
    fn accept(&mut self, sampler: &mut Self::Sampler, token: TokenId);

    /// Destroy the decode context and create a fresh one with the same parameters.
    fn reset_context(&mut self) -> Result<(), BackendError>;
}

/// External vision encoder turning raw image file bytes into an embedding block.
pub trait VisionEncoder {
    fn embed_image_bytes(&self, n_threads: usize, bytes: &[u8]) -> Result<ImageEmbed, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_from_slice_copies_and_counts_positions() {
        let data = vec![0.5f32; EMBED_DIM * 3];
        let embed = ImageEmbed::from_slice(&data).unwrap();
        assert_eq!(embed.n_pos(), 3);
        assert_eq!(embed.as_slice().len(), EMBED_DIM * 3);
        assert_ne!(embed.as_slice().as_ptr(), data.as_ptr());
    }

    #[test]
    fn embed_rejects_ragged_length() {
        let err = ImageEmbed::from_slice(&vec![0.0; EMBED_DIM + 1]).unwrap_err();
        assert!(matches!(err, crate::OcrError::Argument(_)));

        let err = ImageEmbed::new(vec![0.0; EMBED_DIM], 2).unwrap_err();
        assert!(matches!(err, crate::OcrError::Argument(_)));
    }

    #[test]
    fn empty_embed_is_allowed() {
        let embed = ImageEmbed::from_slice(&[]).unwrap();
        assert_eq!(embed.n_pos(), 0);
    }

    #[test]
    fn non_positive_temperature_is_greedy() {
        let mut params = SamplingParams::default();
        assert!(!params.is_greedy());
        params.temperature = -1.0;
        assert!(params.is_greedy());
    }
}
