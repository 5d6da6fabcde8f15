//! Sample-then-replay: draw one token and feed it straight back as context.

use std::borrow::Cow;

use crate::backend::{DecodeBackend, SamplingParams, TokenId};
use crate::error::PrefillStage;
use crate::prefill::Prefill;
use crate::OcrError;

/// Text reported for end-of-generation tokens.
pub const EOG_PIECE: &str = "</s>";

/// One generated token and its raw piece bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub token: TokenId,
    /// May be an incomplete UTF-8 sequence.
    pub piece: Vec<u8>,
    pub end_of_generation: bool,
}

impl Sample {
    /// A token ends generation either by id or by decoding to the EOS piece.
    pub fn is_end(&self) -> bool {
        self.end_of_generation || self.piece == EOG_PIECE.as_bytes()
    }

    pub fn contains(&self, needle: &str) -> bool {
        let needle = needle.as_bytes();
        !needle.is_empty() && self.piece.windows(needle.len()).any(|w| w == needle)
    }

    /// The piece on its own, lossily decoded.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.piece)
    }
}

/// Wraps a backend sampler for one run.
///
/// Token pieces can split a multi-byte character. `push_piece` holds the
/// incomplete tail back and emits it with the next piece; `flush` releases
/// whatever is left.
pub struct SamplerAdapter<B: DecodeBackend> {
    sampler: B::Sampler,
    pending: Vec<u8>,
}

impl<B: DecodeBackend> SamplerAdapter<B> {
    pub fn new(backend: &B, params: &SamplingParams) -> Result<Self, OcrError> {
        let sampler = backend.new_sampler(params).map_err(OcrError::SamplerInit)?;
        Ok(Self {
            sampler,
            pending: Vec::new(),
        })
    }

    pub fn sampler(&self) -> &B::Sampler {
        &self.sampler
    }

    /// Sample the next token, accept it, then decode it so the following
    /// draw sees it in the causal history.
    pub fn next(&mut self, prefill: &mut Prefill<'_, B>) -> Result<Sample, OcrError> {
        let backend = prefill.backend_mut();
        let token = backend.sample(&mut self.sampler)?;
        backend.accept(&mut self.sampler, token);

        let end_of_generation = backend.is_eog(token);
        let piece = if end_of_generation {
            EOG_PIECE.as_bytes().to_vec()
        } else {
            backend.token_to_piece(token)?
        };

        prefill
            .eval_token(token)
            .map_err(|source| OcrError::Prefill {
                stage: PrefillStage::Generated,
                n_past: prefill.n_past(),
                source,
            })?;

        Ok(Sample {
            token,
            piece,
            end_of_generation,
        })
    }

    /// Append piece bytes and return the text they complete.
    pub fn push_piece(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // Incomplete trailing sequence: keep it for the next piece
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => self.flush(),
        }
    }

    /// Bytes still waiting for the rest of a character, lossily decoded.
    pub fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
