//! OCR decode session: the high-level API.
//!
//! Owns a loaded backend (model + one decode context) and turns an image
//! embedding plus an OCR mode into text. Every run starts from an empty
//! context and the context is recreated afterwards, whatever the outcome.
//!
//! ```ignore
//! let mut session: OcrSession<LlamaCppBackend> =
//!     OcrSession::from_args(["got", "-m", "got_decoder-q4_k_m.gguf"])?;
//! let output = session.run(&image_embeds, OcrMode::Format)?;
//! println!("{}", output.text().unwrap_or_default());
//! session.destroy()?;
//! ```

use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, DecodeBackend, ImageEmbed};
use crate::config::OcrConfig;
use crate::error::PrefillStage;
use crate::output::OcrOutput;
use crate::prefill::Prefill;
use crate::prompt::{OcrMode, PromptTemplate};
use crate::sampler::{Sample, SamplerAdapter};
use crate::OcrError;

/// Temperature every OCR run samples with, regardless of configuration.
pub const OCR_TEMPERATURE: f32 = -1.0;

/// Generation stops as soon as a freshly sampled piece contains this.
pub const HARD_STOP: &str = "###";

/// Generation stops once the accumulated response contains any of these.
pub const STOP_STRINGS: [&str; 3] = ["<|im_end|>", "<|im_start|>", "USER:"];

/// Message carried by the output when the sampler cannot be created.
pub const SAMPLER_INIT_ERROR: &str = "Could not init ctx for the sampler";

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Context is empty and a run may start.
    Ready,
    /// A run is in progress.
    Generating,
    /// Recreating the decode context failed; only `reset` or `destroy` are allowed.
    Faulted,
    Destroyed,
}

/// Why the generation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfGeneration,
    HardStop,
    StopString(&'static str),
    MaxTokens,
}

/// Counters from the most recent completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStats {
    /// Positions consumed: prompt tokens, image positions and generated tokens.
    pub n_past: usize,
    /// Tokens sampled, including the one that triggered a stop.
    pub n_generated: usize,
    /// `None` when the run ended before generation started.
    pub stop: Option<StopReason>,
}

pub struct OcrSession<B: DecodeBackend> {
    backend: Option<B>,
    config: OcrConfig,
    state: SessionState,
    last_run: Option<RunStats>,
}

impl<B: DecodeBackend> OcrSession<B> {
    /// Validate `config`, load the model and build the first decode context.
    pub fn create(config: OcrConfig) -> Result<Self, OcrError> {
        config.validate()?;
        info!(
            model = %config.model.display(),
            n_ctx = config.effective_ctx(),
            n_batch = config.n_batch,
            "creating OCR session"
        );
        let backend = B::load(&config).map_err(|e| {
            error!("failed to create OCR session: {e}");
            OcrError::ModelLoad(e)
        })?;
        Ok(Self::with_backend(backend, config))
    }

    /// Parse llama.cpp-style arguments and create a session from them.
    pub fn from_args<I, T>(args: I) -> Result<Self, OcrError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::create(OcrConfig::from_args(args)?)
    }

    /// Wrap an already loaded backend.
    pub fn with_backend(backend: B, config: OcrConfig) -> Self {
        Self {
            backend: Some(backend),
            config,
            state: SessionState::Ready,
            last_run: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &OcrConfig {
        &self.config
    }

    pub fn last_run(&self) -> Option<&RunStats> {
        self.last_run.as_ref()
    }

    pub fn backend(&self) -> Option<&B> {
        self.backend.as_ref()
    }

    /// Run OCR with a raw mode code (1..=4). Unknown codes fail before any
    /// session state is touched.
    pub fn run_code(&mut self, image_embeds: &[f32], code: i32) -> Result<OcrOutput, OcrError> {
        let mode = OcrMode::try_from(code)?;
        self.run(image_embeds, mode)
    }

    /// Run OCR over a flat `n * 1024` embedding block.
    ///
    /// Prefill or sampling failures abort the run with an error; a sampler
    /// that cannot be created yields `OcrOutput::Error`. In every case the
    /// decode context is recreated before returning.
    pub fn run(&mut self, image_embeds: &[f32], mode: OcrMode) -> Result<OcrOutput, OcrError> {
        self.ensure_ready()?;
        let template = mode.templates();
        let embed = ImageEmbed::from_slice(image_embeds)?;

        let backend = self.backend.as_mut().ok_or(OcrError::AlreadyDestroyed)?;
        if backend.n_embd() != embed.dim() {
            return Err(OcrError::Argument(format!(
                "model embedding width {} does not match image embedding width {}",
                backend.n_embd(),
                embed.dim()
            )));
        }

        self.state = SessionState::Generating;
        debug!(?mode, n_pos = embed.n_pos(), "ocr run");
        let outcome = generate(backend, &self.config, &template, &embed);
        drop(embed);

        let reset = self.reset_context();
        let (output, stats) = outcome?;
        reset?;

        info!(
            n_past = stats.n_past,
            n_generated = stats.n_generated,
            stop = ?stats.stop,
            "ocr run finished"
        );
        self.last_run = Some(stats);
        Ok(output)
    }

    /// Drop all causal history by recreating the decode context.
    ///
    /// Calling it repeatedly is harmless.
    pub fn reset(&mut self) -> Result<(), OcrError> {
        match self.state {
            SessionState::Destroyed => Err(OcrError::AlreadyDestroyed),
            SessionState::Generating => Err(OcrError::InvalidState(self.state)),
            SessionState::Ready | SessionState::Faulted => {
                self.reset_context()?;
                self.last_run = None;
                Ok(())
            }
        }
    }

    /// Release the context, model and backend. A second call fails.
    pub fn destroy(&mut self) -> Result<(), OcrError> {
        if self.state == SessionState::Destroyed {
            return Err(OcrError::AlreadyDestroyed);
        }
        drop(self.backend.take());
        self.state = SessionState::Destroyed;
        info!("OCR session destroyed");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), OcrError> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Destroyed => Err(OcrError::AlreadyDestroyed),
            other => Err(OcrError::InvalidState(other)),
        }
    }

    fn reset_context(&mut self) -> Result<(), OcrError> {
        let backend = self.backend.as_mut().ok_or(OcrError::AlreadyDestroyed)?;
        match backend.reset_context() {
            Ok(()) => {
                debug!("decode context reset");
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                error!("failed to recreate decode context: {e}");
                self.state = SessionState::Faulted;
                Err(OcrError::Backend(e))
            }
        }
    }
}

/// Prefill prompt + image, then sample until a stop condition fires.
fn generate<B: DecodeBackend>(
    backend: &mut B,
    config: &OcrConfig,
    template: &PromptTemplate,
    embed: &ImageEmbed,
) -> Result<(OcrOutput, RunStats), OcrError> {
    let mut prefill = Prefill::new(backend, config.batch_size());

    prefill
        .eval_text(template.system, false)
        .map_err(|source| prefill_error(PrefillStage::SystemPrompt, prefill.n_past(), source))?;
    prefill
        .eval_embed(embed)
        .map_err(|source| prefill_error(PrefillStage::ImageEmbed, prefill.n_past(), source))?;
    prefill
        .eval_text(template.user, false)
        .map_err(|source| prefill_error(PrefillStage::UserPrompt, prefill.n_past(), source))?;

    let mut params = config.sampling();
    params.temperature = OCR_TEMPERATURE;
    let mut sampler = match SamplerAdapter::new(prefill.backend(), &params) {
        Ok(sampler) => sampler,
        Err(e) => {
            warn!("{e}");
            let stats = RunStats {
                n_past: prefill.n_past(),
                n_generated: 0,
                stop: None,
            };
            return Ok((OcrOutput::Error(SAMPLER_INIT_ERROR.to_string()), stats));
        }
    };

    let max_tokens = config.max_output_tokens();
    let mut response = String::new();
    let mut stop = StopReason::MaxTokens;
    let mut n_generated = 0;

    for _ in 0..max_tokens {
        let sample = sampler.next(&mut prefill)?;
        n_generated += 1;
        // The triggering piece is never appended; bytes held back from
        // earlier pieces still are, via flush.
        if let Some(reason) = stop_reason(&sample, &response) {
            stop = reason;
            break;
        }
        response.push_str(&sampler.push_piece(&sample.piece));
    }
    response.push_str(&sampler.flush());

    let stats = RunStats {
        n_past: prefill.n_past(),
        n_generated,
        stop: Some(stop),
    };
    Ok((OcrOutput::Text(response), stats))
}

/// Stop checks in priority order: end of generation, hard stop in the new
/// piece, then stop strings anywhere in the response so far.
fn stop_reason(sample: &Sample, response: &str) -> Option<StopReason> {
    if sample.is_end() {
        return Some(StopReason::EndOfGeneration);
    }
    if sample.contains(HARD_STOP) {
        return Some(StopReason::HardStop);
    }
    STOP_STRINGS
        .iter()
        .copied()
        .find(|marker| response.contains(marker))
        .map(StopReason::StopString)
}

fn prefill_error(stage: PrefillStage, n_past: usize, source: BackendError) -> OcrError {
    OcrError::Prefill {
        stage,
        n_past,
        source,
    }
}
