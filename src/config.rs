//! Session configuration, parsed from llama.cpp-style command-line arguments.
//!
//! The shared library is driven by an `argv` array (e.g. from Python
//! `ctypes`), so configuration is parsed with clap from an arbitrary
//! iterator rather than from the process arguments.

use std::path::PathBuf;

use clap::Parser;

use crate::backend::SamplingParams;
use crate::OcrError;

/// Smallest context window a session is ever created with.
pub const MIN_CTX: u32 = 2048;

/// Output budget used when `--n-predict` is negative.
pub const DEFAULT_MAX_OUTPUT_TOKENS: usize = 256;

/// Multi-letter flags that llama.cpp front ends accept with a single dash.
const LEGACY_FLAGS: &[&str] = &["-ngl", "-ub"];

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct OcrConfig {
    /// Path to the GGUF decoder model.
    #[arg(short = 'm', long = "model", value_name = "PATH")]
    pub model: PathBuf,

    /// Requested context size. Sessions never use less than 2048.
    #[arg(short = 'c', long = "ctx-size", default_value_t = 4096)]
    pub n_ctx: u32,

    /// Logical batch size for prefill.
    #[arg(short = 'b', long = "batch-size", default_value_t = 2048)]
    pub n_batch: u32,

    /// Physical batch size.
    #[arg(long = "ubatch-size", alias = "ub", default_value_t = 512)]
    pub n_ubatch: u32,

    /// Maximum tokens to generate; negative means 256.
    #[arg(short = 'n', long = "n-predict", default_value_t = -1, allow_hyphen_values = true)]
    pub n_predict: i32,

    #[arg(long = "temp", default_value_t = 0.8, allow_hyphen_values = true)]
    pub temperature: f32,

    #[arg(long = "top-k", default_value_t = 40)]
    pub top_k: i32,

    #[arg(long = "top-p", default_value_t = 0.95)]
    pub top_p: f32,

    #[arg(long = "repeat-penalty", default_value_t = 1.0)]
    pub repeat_penalty: f32,

    #[arg(long = "repeat-last-n", default_value_t = 64)]
    pub repeat_last_n: i32,

    #[arg(short = 's', long = "seed", default_value_t = u32::MAX)]
    pub seed: u32,

    /// CPU threads for decoding. Defaults to the available parallelism.
    #[arg(short = 't', long = "threads")]
    pub n_threads: Option<usize>,

    /// Layers to offload to the GPU.
    #[arg(long = "n-gpu-layers", alias = "ngl", default_value_t = 0)]
    pub n_gpu_layers: u32,

    /// Log verbosity: negative = errors only, 0 = info, 1+ = debug.
    #[arg(long = "log-verbosity", default_value_t = 0, allow_hyphen_values = true)]
    pub log_verbosity: i32,
}

impl OcrConfig {
    /// Parse an `argv`-style sequence. The first item is the program name.
    pub fn from_args<I, T>(args: I) -> Result<Self, OcrError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let args = normalize_args(args.into_iter().map(Into::into));
        let config =
            Self::try_parse_from(args).map_err(|e| OcrError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a session unusable.
    pub fn validate(&self) -> Result<(), OcrError> {
        if self.model.as_os_str().is_empty() {
            return Err(OcrError::Config("model path is empty".into()));
        }
        if self.n_batch == 0 {
            return Err(OcrError::Config("batch size must be greater than 0".into()));
        }
        if self.n_ubatch == 0 {
            return Err(OcrError::Config("ubatch size must be greater than 0".into()));
        }
        Ok(())
    }

    /// Context length actually requested from the backend.
    pub fn effective_ctx(&self) -> u32 {
        self.n_ctx.max(MIN_CTX)
    }

    pub fn batch_size(&self) -> usize {
        self.n_batch as usize
    }

    pub fn max_output_tokens(&self) -> usize {
        if self.n_predict < 0 {
            DEFAULT_MAX_OUTPUT_TOKENS
        } else {
            self.n_predict as usize
        }
    }

    pub fn threads(&self) -> usize {
        self.n_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    /// Sampling parameters exactly as configured.
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
            seed: self.seed,
        }
    }
}

/// Rewrite `-ngl 100` style flags to their `--ngl` form so clap accepts them.
pub fn normalize_args(args: impl Iterator<Item = String>) -> Vec<String> {
    args.map(|arg| {
        if LEGACY_FLAGS.contains(&arg.as_str()) {
            format!("-{arg}")
        } else {
            arg
        }
    })
    .collect()
}
