//! Batched prefill: pushes known tokens and image embeddings through the decoder.
//!
//! Everything that enters the causal sequence goes through `Prefill`, so its
//! `n_past` is the single position counter for a run: prompt tokens, image
//! positions and every replayed sample all advance it.

use tracing::{debug, error};

use crate::backend::{BackendError, DecodeBackend, ImageEmbed, TokenId};

/// Position-tracking prefill over a borrowed backend.
pub struct Prefill<'a, B: DecodeBackend> {
    backend: &'a mut B,
    n_batch: usize,
    n_past: usize,
}

impl<'a, B: DecodeBackend> Prefill<'a, B> {
    /// Start at position 0. `n_batch` is clamped to at least 1.
    pub fn new(backend: &'a mut B, n_batch: usize) -> Self {
        Self {
            backend,
            n_batch: n_batch.max(1),
            n_past: 0,
        }
    }

    /// Positions consumed so far.
    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn backend(&self) -> &B {
        self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        self.backend
    }

    /// Decode `tokens` in chunks of at most `n_batch`.
    ///
    /// Stops at the first failing chunk; chunks decoded before it stay
    /// counted in `n_past`.
    pub fn eval_tokens(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        for (i, chunk) in tokens.chunks(self.n_batch).enumerate() {
            if let Err(e) = self.backend.decode_tokens(chunk) {
                error!(
                    token = i * self.n_batch,
                    total = tokens.len(),
                    n_batch = self.n_batch,
                    n_past = self.n_past,
                    "failed to eval tokens: {e}"
                );
                return Err(e);
            }
            self.n_past += chunk.len();
        }
        Ok(())
    }

    /// Decode a single token with batch size 1.
    pub fn eval_token(&mut self, token: TokenId) -> Result<(), BackendError> {
        self.backend.decode_tokens(&[token]).inspect_err(|e| {
            error!(n_past = self.n_past, "failed to eval token {}: {e}", token.0);
        })?;
        self.n_past += 1;
        Ok(())
    }

    /// Tokenize `text` and decode it. Returns the number of tokens consumed.
    pub fn eval_text(&mut self, text: &str, add_bos: bool) -> Result<usize, BackendError> {
        let tokens = self.backend.tokenize(text, add_bos)?;
        debug!(n_tokens = tokens.len(), n_past = self.n_past, "prefill text");
        self.eval_tokens(&tokens)?;
        Ok(tokens.len())
    }

    /// Decode an embedding block, `n_batch` image positions at a time.
    pub fn eval_embed(&mut self, embed: &ImageEmbed) -> Result<(), BackendError> {
        let dim = embed.dim();
        let stride = self.n_batch * dim;
        for chunk in embed.as_slice().chunks(stride) {
            let n_eval = chunk.len() / dim;
            if let Err(e) = self.backend.decode_embeddings(chunk, n_eval) {
                error!(
                    n_pos = embed.n_pos(),
                    n_eval,
                    n_past = self.n_past,
                    "failed to eval image embedding: {e}"
                );
                return Err(e);
            }
            self.n_past += n_eval;
        }
        debug!(n_pos = embed.n_pos(), n_past = self.n_past, "prefill image embedding");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{Call, ScriptedBackend};
    use crate::backend::EMBED_DIM;

    fn tokens(n: i32) -> Vec<TokenId> {
        (0..n).map(|i| TokenId(100 + i)).collect()
    }

    #[test]
    fn tokens_are_chunked_by_batch_size() {
        let mut backend = ScriptedBackend::new();
        let mut prefill = Prefill::new(&mut backend, 4);

        prefill.eval_tokens(&tokens(10)).unwrap();
        assert_eq!(prefill.n_past(), 10);

        let sizes: Vec<usize> = backend
            .calls
            .iter()
            .map(|c| match c {
                Call::Tokens(t) => t.len(),
                other => panic!("unexpected call {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let mut backend = ScriptedBackend::new();
        let mut prefill = Prefill::new(&mut backend, 8);
        prefill.eval_tokens(&[]).unwrap();
        prefill
            .eval_embed(&ImageEmbed::from_slice(&[]).unwrap())
            .unwrap();
        assert_eq!(prefill.n_past(), 0);
        assert_eq!(backend.decode_call_count(), 0);
    }

    #[test]
    fn failed_chunk_keeps_earlier_progress() {
        let mut backend = ScriptedBackend::new().failing_decode_at(1);
        let mut prefill = Prefill::new(&mut backend, 3);

        let err = prefill.eval_tokens(&tokens(9)).unwrap_err();
        assert!(matches!(err, BackendError::Decode { n_items: 3, .. }));
        // First chunk landed, the failing one did not, the third was never tried
        assert_eq!(prefill.n_past(), 3);
        assert_eq!(backend.decode_call_count(), 2);
    }

    #[test]
    fn embeddings_advance_same_counter() {
        let mut backend = ScriptedBackend::new();
        let mut prefill = Prefill::new(&mut backend, 4);

        prefill.eval_tokens(&tokens(5)).unwrap();
        let embed = ImageEmbed::from_slice(&vec![0.25; EMBED_DIM * 10]).unwrap();
        prefill.eval_embed(&embed).unwrap();
        assert_eq!(prefill.n_past(), 15);

        let embed_calls: Vec<&Call> = backend
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Embeddings(_)))
            .collect();
        assert_eq!(
            embed_calls,
            vec![&Call::Embeddings(4), &Call::Embeddings(4), &Call::Embeddings(2)]
        );
    }

    #[test]
    fn failed_embedding_chunk_stops_early() {
        let mut backend = ScriptedBackend::new().failing_decode_at(2);
        let mut prefill = Prefill::new(&mut backend, 2);
        let embed = ImageEmbed::from_slice(&vec![0.0; EMBED_DIM * 7]).unwrap();

        assert!(prefill.eval_embed(&embed).is_err());
        assert_eq!(prefill.n_past(), 4);
        assert_eq!(backend.decode_call_count(), 3);
    }

    #[test]
    fn single_token_and_text_prefill() {
        let mut backend = ScriptedBackend::new();
        let mut prefill = Prefill::new(&mut backend, 512);

        let n = prefill.eval_text("OCR: ", false).unwrap();
        assert_eq!(n, 5);
        prefill.eval_token(TokenId(42)).unwrap();
        assert_eq!(prefill.n_past(), 6);
        assert_eq!(backend.calls.last(), Some(&Call::Tokens(vec![TokenId(42)])));
    }

    #[test]
    fn zero_batch_is_clamped() {
        let mut backend = ScriptedBackend::new();
        let mut prefill = Prefill::new(&mut backend, 0);
        prefill.eval_tokens(&tokens(3)).unwrap();
        assert_eq!(prefill.n_past(), 3);
        assert_eq!(backend.decode_call_count(), 3);
    }
}
