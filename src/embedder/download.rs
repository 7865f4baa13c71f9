/// Model file download from HuggingFace.
///
/// Fetches the ONNX export and tokenizer of a HuggingFace checkpoint (the E5
/// embedder or the bge reranker) into a local directory, skipping files that
/// already exist.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

const HF_BASE: &str = "https://huggingface.co";

/// Organisation of the E5 embedding checkpoints.
pub const EMBEDDER_ORG: &str = "intfloat";
/// Organisation of the bge reranker checkpoints.
pub const RERANKER_ORG: &str = "BAAI";

/// Files required for the embedder, with their paths inside the HF repo.
const MODEL_FILES: &[(&str, &str)] = &[
    ("model.onnx", "onnx/model.onnx"),
    ("tokenizer.json", "tokenizer.json"),
    ("config.json", "config.json"),
    ("special_tokens_map.json", "special_tokens_map.json"),
    ("tokenizer_config.json", "tokenizer_config.json"),
];

/// Return the default model directory for a model name.
#[must_use]
pub fn default_model_dir(model_name: &str) -> PathBuf {
    PathBuf::from("models").join(model_name)
}

/// Check whether all required model files exist in `model_dir`.
#[must_use]
pub fn all_files_present(model_dir: &Path) -> bool {
    MODEL_FILES
        .iter()
        .all(|(name, _)| model_dir.join(name).exists())
}

/// HuggingFace repo for `model_name`; bare names are placed under `org`.
#[must_use]
pub fn hf_repo(org: &str, model_name: &str) -> String {
    if model_name.contains('/') {
        model_name.to_string()
    } else {
        format!("{org}/{model_name}")
    }
}

/// Download missing model files of HuggingFace `repo` into `model_dir`.
///
/// Blocking; call from `spawn_blocking` or before the runtime starts
/// serving requests.
pub fn download_model_files(model_dir: &Path, repo: &str) -> Result<()> {
    fs::create_dir_all(model_dir)
        .with_context(|| format!("failed to create models directory: {}", model_dir.display()))?;

    if all_files_present(model_dir) {
        info!(dir = %model_dir.display(), "All model files found, skipping download");
        return Ok(());
    }

    info!(repo, "Downloading model files from HuggingFace (one-time)");

    for &(filename, url_path) in MODEL_FILES {
        let dest = model_dir.join(filename);
        if dest.exists() {
            continue;
        }

        let url = format!("{HF_BASE}/{repo}/resolve/main/{url_path}");
        info!(file = filename, "Downloading");
        download_file(&dest, &url).with_context(|| format!("failed to download {filename}"))?;
    }

    info!("Model download complete");
    Ok(())
}

fn download_file(dest: &Path, url: &str) -> Result<()> {
    let resp =
        reqwest::blocking::get(url).with_context(|| format!("HTTP request failed: {url}"))?;

    if !resp.status().is_success() {
        anyhow::bail!("bad status: {} for {url}", resp.status());
    }

    let total = resp.content_length().unwrap_or(0);
    let pb = if total > 0 {
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {percent}% ({bytes}/{total_bytes}) {msg}")
            .context("invalid progress template")?
            .progress_chars("█▓░");
        pb.set_style(style);
        pb
    } else {
        ProgressBar::new_spinner()
    };

    // Write to a temp name first so an interrupted download is not mistaken
    // for a complete file on the next start.
    let partial = dest.with_extension("part");
    let bytes = resp.bytes().context("failed to read response body")?;
    let mut file = fs::File::create(&partial)
        .with_context(|| format!("failed to create file: {}", partial.display()))?;
    file.write_all(&bytes).context("failed to write file")?;
    fs::rename(&partial, dest)
        .with_context(|| format!("failed to move {} into place", partial.display()))?;

    pb.set_position(bytes.len() as u64);
    pb.finish_and_clear();
    Ok(())
}
