use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use got_ocr::backend::llama_cpp::LlamaCppBackend;
use got_ocr::config::normalize_args;
use got_ocr::{logging, OcrConfig, OcrMode, OcrSession, EMBED_DIM};
use tracing::{error, info};

/// Run GOT OCR over a precomputed image embedding block.
#[derive(Parser, Debug)]
#[command(name = "got-ocr", version, about, long_about = None)]
struct Cli {
    /// Raw little-endian f32 file holding `n x 1024` image embeddings.
    #[arg(short = 'e', long = "embeddings", value_name = "PATH")]
    embeddings: PathBuf,

    /// OCR mode: ocr, format, crop-ocr, crop-format (or 1..4).
    #[arg(long = "mode", default_value = "ocr", value_parser = parse_mode)]
    mode: OcrMode,

    #[command(flatten)]
    config: OcrConfig,
}

fn parse_mode(raw: &str) -> Result<OcrMode, String> {
    match raw.parse::<i32>() {
        Ok(code) => OcrMode::try_from(code).map_err(|e| e.to_string()),
        Err(_) => raw.parse::<OcrMode>().map_err(|e| e.to_string()),
    }
}

fn main() {
    let cli = Cli::parse_from(normalize_args(std::env::args()));
    logging::init(cli.config.log_verbosity);
    if let Err(err) = try_run(cli) {
        error!(error = %err, "got-ocr failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_run(cli: Cli) -> Result<()> {
    let embeds = read_embeddings(&cli.embeddings)?;
    info!(
        path = %cli.embeddings.display(),
        n_pos = embeds.len() / EMBED_DIM,
        mode = ?cli.mode,
        "loaded image embeddings"
    );

    let mut session = OcrSession::<LlamaCppBackend>::create(cli.config)
        .context("failed to create OCR session")?;
    let output = session.run(&embeds, cli.mode).context("OCR run failed")?;
    if let Some(stats) = session.last_run() {
        info!(n_past = stats.n_past, n_generated = stats.n_generated, stop = ?stats.stop, "done");
    }
    session.destroy()?;

    match output.into_result() {
        Ok(text) => {
            println!("{text}");
            Ok(())
        }
        Err(message) => bail!("{message}"),
    }
}

fn read_embeddings(path: &Path) -> Result<Vec<f32>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let row = EMBED_DIM * std::mem::size_of::<f32>();
    if bytes.len() % row != 0 {
        bail!(
            "{} is {} bytes, not a whole number of {}-float rows",
            path.display(),
            bytes.len(),
            EMBED_DIM
        );
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
