//! llama.cpp backend: GGUF decoder loading and inference via llama-cpp-sys-2.
//!
//! This backend talks to the llama.cpp C API directly because image
//! positions are fed as raw embedding batches, which the safe wrappers do
//! not expose. It handles:
//! - backend init/teardown (reference counted, one controlled init point)
//! - GGUF model loading and context creation
//! - token and embedding batches, tokenization, detokenization
//! - sampler chains
//!
//! Every raw handle is owned by a small RAII wrapper so that partially
//! constructed backends release what they acquired on every error path.

#[cfg(feature = "llama-cpp")]
mod inner {
    use std::ffi::{c_char, CString};
    use std::ptr::{self, NonNull};
    use std::sync::Mutex;

    use llama_cpp_sys_2 as sys;
    use tracing::{debug, info};

    use crate::backend::{BackendError, DecodeBackend, SamplingParams, TokenId};
    use crate::config::OcrConfig;

    static BACKEND_USERS: Mutex<usize> = Mutex::new(0);

    /// Keeps the process-wide llama.cpp backend alive.
    struct BackendGuard;

    impl BackendGuard {
        fn acquire() -> Self {
            let mut users = BACKEND_USERS.lock().unwrap_or_else(|e| e.into_inner());
            if *users == 0 {
                // SAFETY: serialized by BACKEND_USERS; paired with llama_backend_free in Drop.
                unsafe { sys::llama_backend_init() };
                debug!("llama backend initialized");
            }
            *users += 1;
            Self
        }
    }

    impl Drop for BackendGuard {
        fn drop(&mut self) {
            let mut users = BACKEND_USERS.lock().unwrap_or_else(|e| e.into_inner());
            *users -= 1;
            if *users == 0 {
                // SAFETY: last user; no model or context outlives its guard.
                unsafe { sys::llama_backend_free() };
                debug!("llama backend freed");
            }
        }
    }

    struct ModelHandle(NonNull<sys::llama_model>);

    impl Drop for ModelHandle {
        fn drop(&mut self) {
            // SAFETY: pointer came from llama_model_load_from_file and is freed once.
            unsafe { sys::llama_model_free(self.0.as_ptr()) };
        }
    }

    struct ContextHandle(NonNull<sys::llama_context>);

    impl ContextHandle {
        fn new(
            model: &ModelHandle,
            params: sys::llama_context_params,
        ) -> Result<Self, BackendError> {
            // SAFETY: model is a live handle; params is a plain value.
            let raw = unsafe { sys::llama_init_from_model(model.0.as_ptr(), params) };
            NonNull::new(raw)
                .map(Self)
                .ok_or_else(|| BackendError::Context("llama_init_from_model returned null".into()))
        }
    }

    impl Drop for ContextHandle {
        fn drop(&mut self) {
            // SAFETY: pointer came from llama_init_from_model and is freed once.
            unsafe { sys::llama_free(self.0.as_ptr()) };
        }
    }

    /// A llama.cpp sampler chain.
    pub struct LlamaCppSampler(NonNull<sys::llama_sampler>);

    impl LlamaCppSampler {
        fn chain(params: &SamplingParams) -> Result<Self, BackendError> {
            // SAFETY: the chain takes ownership of every sampler added to it.
            unsafe {
                let chain = sys::llama_sampler_chain_init(sys::llama_sampler_chain_default_params());
                let chain = NonNull::new(chain)
                    .ok_or_else(|| BackendError::Sampler("chain init returned null".into()))?;
                let owned = Self(chain);

                let raw = chain.as_ptr();
                sys::llama_sampler_chain_add(
                    raw,
                    sys::llama_sampler_init_penalties(
                        params.repeat_last_n,
                        params.repeat_penalty,
                        0.0,
                        0.0,
                    ),
                );
                if params.is_greedy() {
                    sys::llama_sampler_chain_add(raw, sys::llama_sampler_init_greedy());
                } else {
                    sys::llama_sampler_chain_add(raw, sys::llama_sampler_init_top_k(params.top_k));
                    sys::llama_sampler_chain_add(raw, sys::llama_sampler_init_top_p(params.top_p, 1));
                    sys::llama_sampler_chain_add(raw, sys::llama_sampler_init_temp(params.temperature));
                    sys::llama_sampler_chain_add(raw, sys::llama_sampler_init_dist(params.seed));
                }
                Ok(owned)
            }
        }
    }

    impl Drop for LlamaCppSampler {
        fn drop(&mut self) {
            // SAFETY: frees the chain and every sampler it owns.
            unsafe { sys::llama_sampler_free(self.0.as_ptr()) };
        }
    }

    /// llama.cpp decoder backend.
    ///
    /// Field ordering matters: ctx drops before model drops before backend.
    pub struct LlamaCppBackend {
        // IMPORTANT: ctx must be declared BEFORE model so it drops first.
        // None only after a failed reset.
        ctx: Option<ContextHandle>,
        model: ModelHandle,
        _backend: BackendGuard,
        ctx_params: sys::llama_context_params,
        vocab: *const sys::llama_vocab,
        n_vocab: usize,
        n_embd: usize,
    }

    impl LlamaCppBackend {
        fn context_params(config: &OcrConfig) -> sys::llama_context_params {
            let threads = i32::try_from(config.threads()).unwrap_or(i32::MAX);
            // SAFETY: returns a plain value.
            let mut params = unsafe { sys::llama_context_default_params() };
            params.n_ctx = config.effective_ctx();
            params.n_batch = config.n_batch;
            params.n_ubatch = config.n_ubatch.min(config.n_batch);
            params.n_threads = threads;
            params.n_threads_batch = threads;
            params
        }

        fn ctx_ptr(&self) -> Result<*mut sys::llama_context, BackendError> {
            self.ctx
                .as_ref()
                .map(|ctx| ctx.0.as_ptr())
                .ok_or_else(|| BackendError::Context("no decode context".into()))
        }

        fn decode(&mut self, batch: sys::llama_batch, n_items: usize) -> Result<(), BackendError> {
            let ctx = self.ctx_ptr()?;
            // SAFETY: ctx is live and the batch points into memory the caller
            // keeps alive for the duration of this call.
            let status = unsafe { sys::llama_decode(ctx, batch) };
            if status != 0 {
                return Err(BackendError::Decode { status, n_items });
            }
            Ok(())
        }
    }

    impl DecodeBackend for LlamaCppBackend {
        type Sampler = LlamaCppSampler;

        fn load(config: &OcrConfig) -> Result<Self, BackendError> {
            if !config.model.is_file() {
                return Err(BackendError::Load(format!(
                    "GGUF file not found: {}",
                    config.model.display()
                )));
            }
            let path = config
                .model
                .to_str()
                .and_then(|p| CString::new(p).ok())
                .ok_or_else(|| {
                    BackendError::Load(format!("unusable model path: {}", config.model.display()))
                })?;

            let backend = BackendGuard::acquire();

            // SAFETY: returns a plain value.
            let mut model_params = unsafe { sys::llama_model_default_params() };
            model_params.n_gpu_layers = i32::try_from(config.n_gpu_layers).unwrap_or(i32::MAX);

            // SAFETY: path is a valid NUL-terminated string for the duration of the call.
            let raw = unsafe { sys::llama_model_load_from_file(path.as_ptr(), model_params) };
            let model = NonNull::new(raw).map(ModelHandle).ok_or_else(|| {
                BackendError::Load(format!("llama.cpp could not load {}", config.model.display()))
            })?;

            let ctx_params = Self::context_params(config);
            let ctx = ContextHandle::new(&model, ctx_params)?;

            // SAFETY: model is live; the vocab lives as long as the model.
            let (vocab, n_embd) = unsafe {
                (
                    sys::llama_model_get_vocab(model.0.as_ptr()),
                    sys::llama_model_n_embd(model.0.as_ptr()),
                )
            };
            // SAFETY: vocab was just taken from the live model.
            let n_vocab = unsafe { sys::llama_vocab_n_tokens(vocab) };

            info!(
                model = %config.model.display(),
                n_ctx = ctx_params.n_ctx,
                n_batch = ctx_params.n_batch,
                n_embd,
                "llama.cpp model loaded"
            );

            Ok(Self {
                ctx: Some(ctx),
                model,
                _backend: backend,
                ctx_params,
                vocab,
                n_vocab: usize::try_from(n_vocab).unwrap_or(0),
                n_embd: usize::try_from(n_embd).unwrap_or(0),
            })
        }

        fn decode_tokens(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
            if tokens.is_empty() {
                return Ok(());
            }
            let mut ids: Vec<sys::llama_token> = tokens.iter().map(|t| t.0).collect();
            // SAFETY: ids outlives the decode call below.
            let batch = unsafe { sys::llama_batch_get_one(ids.as_mut_ptr(), ids.len() as i32) };
            self.decode(batch, tokens.len())
        }

        fn decode_embeddings(&mut self, embd: &[f32], n_items: usize) -> Result<(), BackendError> {
            if n_items == 0 {
                return Ok(());
            }
            if embd.len() != n_items * self.n_embd {
                return Err(BackendError::Decode {
                    status: -1,
                    n_items,
                });
            }
            // Positions and sequence ids are left to the context, as with
            // llama_batch_get_one. llama.cpp only reads the embedding buffer.
            let batch = sys::llama_batch {
                n_tokens: n_items as i32,
                token: ptr::null_mut(),
                embd: embd.as_ptr() as *mut f32,
                pos: ptr::null_mut(),
                n_seq_id: ptr::null_mut(),
                seq_id: ptr::null_mut(),
                logits: ptr::null_mut(),
            };
            self.decode(batch, n_items)
        }

        fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
            let len = i32::try_from(text.len())
                .map_err(|_| BackendError::Tokenizer("prompt too long".into()))?;
            let mut tokens: Vec<sys::llama_token> = vec![0; text.len() + 2];
            for _ in 0..2 {
                // SAFETY: text and tokens are valid for the lengths passed.
                let n = unsafe {
                    sys::llama_tokenize(
                        self.vocab,
                        text.as_ptr() as *const c_char,
                        len,
                        tokens.as_mut_ptr(),
                        tokens.len() as i32,
                        add_bos,
                        true,
                    )
                };
                if n >= 0 {
                    tokens.truncate(n as usize);
                    return Ok(tokens.into_iter().map(TokenId).collect());
                }
                // Negative result is the required buffer size
                tokens.resize(n.unsigned_abs() as usize, 0);
            }
            Err(BackendError::Tokenizer(format!(
                "could not tokenize {} bytes",
                text.len()
            )))
        }

        fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
            let mut buf = vec![0u8; 64];
            for _ in 0..2 {
                // SAFETY: buf is valid for buf.len() bytes.
                let n = unsafe {
                    sys::llama_token_to_piece(
                        self.vocab,
                        token.0,
                        buf.as_mut_ptr() as *mut c_char,
                        buf.len() as i32,
                        0,
                        true,
                    )
                };
                if n >= 0 {
                    buf.truncate(n as usize);
                    return Ok(buf);
                }
                buf.resize(n.unsigned_abs() as usize, 0);
            }
            Err(BackendError::Tokenizer(format!(
                "could not detokenize token {}",
                token.0
            )))
        }

        fn is_eog(&self, token: TokenId) -> bool {
            // SAFETY: vocab belongs to the live model.
            unsafe { sys::llama_vocab_is_eog(self.vocab, token.0) }
        }

        fn n_embd(&self) -> usize {
            self.n_embd
        }

        fn new_sampler(&self, params: &SamplingParams) -> Result<Self::Sampler, BackendError> {
            debug!(?params, "creating sampler chain");
            LlamaCppSampler::chain(params)
        }

        /// Runs the chain over the last logits row without accepting the
        /// result; `accept` is the only place a token enters the penalty window.
        fn sample(&mut self, sampler: &mut Self::Sampler) -> Result<TokenId, BackendError> {
            let ctx = self.ctx_ptr()?;
            // SAFETY: ctx is live; -1 selects the last logits row.
            let logits = unsafe { sys::llama_get_logits_ith(ctx, -1) };
            if logits.is_null() || self.n_vocab == 0 {
                return Err(BackendError::Sampler("no logits for the last position".into()));
            }
            // SAFETY: the row holds n_vocab floats and stays valid until the next decode.
            let logits = unsafe { std::slice::from_raw_parts(logits, self.n_vocab) };

            let mut candidates: Vec<sys::llama_token_data> = logits
                .iter()
                .enumerate()
                .map(|(id, &logit)| sys::llama_token_data {
                    id: id as sys::llama_token,
                    logit,
                    p: 0.0,
                })
                .collect();
            let mut array = sys::llama_token_data_array {
                data: candidates.as_mut_ptr(),
                size: candidates.len(),
                selected: -1,
                sorted: false,
            };
            // SAFETY: array points into candidates, which outlives the call.
            unsafe { sys::llama_sampler_apply(sampler.0.as_ptr(), &mut array) };

            let selected = usize::try_from(array.selected)
                .ok()
                .filter(|&i| i < array.size)
                .ok_or_else(|| BackendError::Sampler("sampler chain selected no token".into()))?;
            // SAFETY: selected is within the array the chain left behind.
            let token = unsafe { (*array.data.add(selected)).id };
            Ok(TokenId(token))
        }

        fn accept(&mut self, sampler: &mut Self::Sampler, token: TokenId) {
            // SAFETY: sampler is live.
            unsafe { sys::llama_sampler_accept(sampler.0.as_ptr(), token.0) };
        }

        fn reset_context(&mut self) -> Result<(), BackendError> {
            // Free the old context before allocating its replacement
            drop(self.ctx.take());
            self.ctx = Some(ContextHandle::new(&self.model, self.ctx_params)?);
            debug!(n_ctx = self.ctx_params.n_ctx, "llama context recreated");
            Ok(())
        }
    }
}

#[cfg(feature = "llama-cpp")]
pub use inner::{LlamaCppBackend, LlamaCppSampler};
