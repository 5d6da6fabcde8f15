//! Scripted in-process backend for tests.
//!
//! Records every decode call, replays a fixed stream of sampled pieces and
//! can be told to fail a specific decode call. Live instances are counted
//! per thread so tests can assert that failed constructions leak nothing.

use std::cell::Cell;

use super::{BackendError, DecodeBackend, SamplingParams, TokenId, EMBED_DIM};
use crate::config::OcrConfig;

/// Token id reported as end-of-generation.
pub const EOS: TokenId = TokenId(2);

/// Script pieces that are emitted as `EOS` instead of text.
pub const EOS_PIECE: &str = "</s>";

const SCRIPT_BASE: i32 = 1_000_000;

thread_local! {
    static LIVE: Cell<usize> = const { Cell::new(0) };
}

/// Number of scripted backends alive on the current thread.
pub fn live_backends() -> usize {
    LIVE.with(|live| live.get())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Tokens(Vec<TokenId>),
    Embeddings(usize),
    Reset,
}

#[derive(Debug, Default)]
pub struct ScriptedSampler {
    pub params: SamplingParams,
    pub accepted: Vec<TokenId>,
}

#[derive(Debug)]
pub struct ScriptedBackend {
    pub calls: Vec<Call>,
    /// Index (over all decode calls) of the call that should fail.
    pub fail_decode_at: Option<usize>,
    pub fail_sampler_init: bool,
    pub fail_reset: bool,
    pub n_embd: usize,
    /// Items consumed by the current context since the last reset.
    pub n_decoded: usize,
    pub resets: usize,
    /// Parameters of the sampler used for the most recent draw.
    pub last_sampling: Option<SamplingParams>,
    script: Vec<Vec<u8>>,
    cursor: usize,
    decode_calls: usize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        LIVE.with(|live| live.set(live.get() + 1));
        Self {
            calls: Vec::new(),
            fail_decode_at: None,
            fail_sampler_init: false,
            fail_reset: false,
            n_embd: EMBED_DIM,
            n_decoded: 0,
            resets: 0,
            last_sampling: None,
            script: Vec::new(),
            cursor: 0,
            decode_calls: 0,
        }
    }

    /// Pieces the sampler will hand out, in order. `"</s>"` becomes `EOS`.
    pub fn with_output(self, pieces: &[&str]) -> Self {
        self.with_raw_output(pieces.iter().map(|p| p.as_bytes().to_vec()).collect())
    }

    /// Like `with_output`, for pieces that are not valid UTF-8 on their own.
    pub fn with_raw_output(mut self, pieces: Vec<Vec<u8>>) -> Self {
        self.script = pieces;
        self.cursor = 0;
        self
    }

    pub fn failing_decode_at(mut self, call: usize) -> Self {
        self.fail_decode_at = Some(call);
        self
    }

    pub fn decode_call_count(&self) -> usize {
        self.decode_calls
    }

    /// Number of sampler draws so far.
    pub fn sampled(&self) -> usize {
        self.cursor
    }

    fn begin_decode(&mut self, n_items: usize) -> Result<(), BackendError> {
        let index = self.decode_calls;
        self.decode_calls += 1;
        if self.fail_decode_at == Some(index) {
            return Err(BackendError::Decode { status: 1, n_items });
        }
        Ok(())
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        LIVE.with(|live| live.set(live.get() - 1));
    }
}

impl DecodeBackend for ScriptedBackend {
    type Sampler = ScriptedSampler;

    fn load(config: &OcrConfig) -> Result<Self, BackendError> {
        if !config.model.is_file() {
            return Err(BackendError::Load(format!(
                "model file not found: {}",
                config.model.display()
            )));
        }
        Ok(Self::new())
    }

    fn decode_tokens(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        self.begin_decode(tokens.len())?;
        self.calls.push(Call::Tokens(tokens.to_vec()));
        self.n_decoded += tokens.len();
        Ok(())
    }

    fn decode_embeddings(&mut self, embd: &[f32], n_items: usize) -> Result<(), BackendError> {
        assert_eq!(embd.len(), n_items * self.n_embd);
        self.begin_decode(n_items)?;
        self.calls.push(Call::Embeddings(n_items));
        self.n_decoded += n_items;
        Ok(())
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(TokenId(1));
        }
        tokens.extend(text.chars().map(|c| TokenId(c as i32)));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        if token.0 >= SCRIPT_BASE {
            let idx = (token.0 - SCRIPT_BASE) as usize;
            return self
                .script
                .get(idx)
                .cloned()
                .ok_or_else(|| BackendError::Tokenizer(format!("unknown token {}", token.0)));
        }
        char::from_u32(token.0 as u32)
            .map(|c| c.to_string().into_bytes())
            .ok_or_else(|| BackendError::Tokenizer(format!("unknown token {}", token.0)))
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn n_embd(&self) -> usize {
        self.n_embd
    }

    fn new_sampler(&self, params: &SamplingParams) -> Result<Self::Sampler, BackendError> {
        if self.fail_sampler_init {
            return Err(BackendError::Sampler("scripted failure".into()));
        }
        Ok(ScriptedSampler {
            params: params.clone(),
            accepted: Vec::new(),
        })
    }

    fn sample(&mut self, sampler: &mut Self::Sampler) -> Result<TokenId, BackendError> {
        self.last_sampling = Some(sampler.params.clone());
        let idx = self.cursor;
        self.cursor += 1;
        match self.script.get(idx) {
            Some(piece) if piece.as_slice() == EOS_PIECE.as_bytes() => Ok(EOS),
            Some(_) => Ok(TokenId(SCRIPT_BASE + idx as i32)),
            None => Ok(EOS),
        }
    }

    fn accept(&mut self, sampler: &mut Self::Sampler, token: TokenId) {
        sampler.accepted.push(token);
    }

    fn reset_context(&mut self) -> Result<(), BackendError> {
        if self.fail_reset {
            return Err(BackendError::Context("scripted failure".into()));
        }
        self.calls.push(Call::Reset);
        self.n_decoded = 0;
        self.resets += 1;
        Ok(())
    }
}
