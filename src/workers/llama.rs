//! `llama-cli` text-generation workers.
//!
//! In interactive mode `llama-cli` prints `"\n> "` when it is ready for
//! input and again after each generated answer, so the same literal serves
//! as readiness marker and response sentinel. It exits on end-of-input,
//! so closing stdin is its termination signal.

use std::num::NonZeroUsize;

use crate::session::{SpawnSpec, Termination};
use crate::workers::profile::WorkerProfile;

/// Default `llama-cli` executable.
pub const DEFAULT_LLAMA_CLI: &str = "llama-cli";

/// Prompt printed by interactive `llama-cli`.
pub const LLAMA_PROMPT: &str = "\n> ";

/// Command-line settings for a GGUF model served by `llama-cli`.
///
/// Zero numeric values leave the corresponding flag unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LlamaSettings {
    /// Path to the `.gguf` model file; also the cache key.
    pub model_path: String,
    /// CPU threads (`--threads`).
    pub threads: usize,
    /// Tokens to predict per answer (`--n-predict`).
    pub n_predict: u32,
    /// Prompt batch size (`--batch-size`).
    pub batch_size: u32,
    /// Disable memory-mapping the model (`--no-mmap`).
    pub no_mmap: bool,
    /// One-shot prompt, used only outside interactive mode (`-p`).
    pub prompt: Option<String>,
}

impl LlamaSettings {
    /// All cores, a large batch, and no memory mapping.
    #[must_use]
    pub fn performance(model_path: impl Into<String>, n_predict: u32) -> Self {
        Self {
            model_path: model_path.into(),
            threads: available_cores(),
            n_predict,
            batch_size: 4096,
            no_mmap: true,
            prompt: None,
        }
    }

    /// Half the cores and the stock batch size.
    #[must_use]
    pub fn balanced(model_path: impl Into<String>, n_predict: u32) -> Self {
        Self {
            model_path: model_path.into(),
            threads: (available_cores() / 2).max(1),
            n_predict,
            batch_size: 512,
            no_mmap: false,
            prompt: None,
        }
    }

    /// Render the settings as `llama-cli` arguments.
    ///
    /// In interactive mode the prompt is sent over stdin, so `-p` is
    /// omitted.
    #[must_use]
    pub fn to_args(&self, interactive: bool) -> Vec<String> {
        let mut args = vec!["-m".to_owned(), self.model_path.clone()];

        if interactive {
            args.push("-i".to_owned());
        } else if let Some(prompt) = self.prompt.as_deref().filter(|p| !p.is_empty()) {
            args.push("-p".to_owned());
            args.push(prompt.to_owned());
        }
        if self.n_predict > 0 {
            args.push("--n-predict".to_owned());
            args.push(self.n_predict.to_string());
        }
        if self.threads > 0 {
            args.push("--threads".to_owned());
            args.push(self.threads.to_string());
        }
        if self.batch_size > 0 {
            args.push("--batch-size".to_owned());
            args.push(self.batch_size.to_string());
        }
        if self.no_mmap {
            args.push("--no-mmap".to_owned());
        }

        args
    }

    /// Interactive worker profile keyed by the model path.
    #[must_use]
    pub fn profile(&self, binary: &str) -> WorkerProfile {
        let spec = SpawnSpec::new(binary)
            .args(self.to_args(true))
            .termination(Termination::CloseInput);
        WorkerProfile::new(self.model_path.clone(), spec, LLAMA_PROMPT, LLAMA_PROMPT)
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
