//! Python-hosted vision model workers (BLIP, CLIP, CLIPtion).
//!
//! Each family is a Python script started with `--interactive`. It prints
//! a `[<FAMILY>] Ready.` banner once the model is loaded, then reads one
//! JSON request per line and answers with one JSON object followed by
//! [`VISION_SENTINEL`]. `{"command": "exit"}` stops it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::session::{SpawnSpec, Termination};
use crate::workers::profile::WorkerProfile;

/// Marker printed after every vision response.
pub const VISION_SENTINEL: &str = "<<END_OF_RESPONSE>>";

/// Default compute device.
pub const DEFAULT_DEVICE: &str = "cpu";

/// Supported vision model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionFamily {
    /// BLIP-2 image captioning.
    Blip,
    /// CLIP zero-shot image classification.
    Clip,
    /// CLIPtion captioning on top of CLIP.
    Cliption,
}

impl VisionFamily {
    /// Script path relative to the scripts directory.
    #[must_use]
    pub fn script(self) -> &'static str {
        match self {
            Self::Blip => "blip.py",
            Self::Clip => "clip.py",
            Self::Cliption => "cliption/cliption.py",
        }
    }

    /// Banner the script prints once its model is loaded.
    #[must_use]
    pub fn ready_marker(self) -> &'static str {
        match self {
            Self::Blip => "[BLIP] Ready.",
            Self::Clip => "[CLIP] Ready.",
            Self::Cliption => "[CLIPtion] Ready.",
        }
    }
}

/// A vision model to serve from a Python interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionWorker {
    /// Model family.
    pub family: VisionFamily,
    /// Python interpreter (usually inside a virtualenv).
    pub python: String,
    /// Directory holding the family scripts.
    pub scripts_dir: PathBuf,
    /// Model directory; also the cache key.
    pub model_path: String,
    /// Compute device, e.g. `cpu` or `cuda`.
    pub device: String,
}

impl VisionWorker {
    /// Worker for `family` with the default device.
    #[must_use]
    pub fn new(
        family: VisionFamily,
        python: impl Into<String>,
        scripts_dir: impl AsRef<Path>,
        model_path: impl Into<String>,
    ) -> Self {
        Self {
            family,
            python: python.into(),
            scripts_dir: scripts_dir.as_ref().to_path_buf(),
            model_path: model_path.into(),
            device: DEFAULT_DEVICE.to_owned(),
        }
    }

    /// Arguments passed to the interpreter.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        vec![
            self.scripts_dir
                .join(self.family.script())
                .to_string_lossy()
                .into_owned(),
            "--model-path".to_owned(),
            self.model_path.clone(),
            "--device".to_owned(),
            self.device.clone(),
            "--interactive".to_owned(),
        ]
    }

    /// Worker profile keyed by the model path.
    #[must_use]
    pub fn profile(&self) -> WorkerProfile {
        let spec = SpawnSpec::new(self.python.clone())
            .args(self.args())
            .env("PYTHONUNBUFFERED", "1")
            .termination(Termination::ExitRequest);
        WorkerProfile::new(
            self.model_path.clone(),
            spec,
            self.family.ready_marker(),
            VISION_SENTINEL,
        )
    }
}

/// One request line sent to a vision worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum VisionRequest {
    /// Caption an image (BLIP, CLIPtion).
    Caption {
        /// Image to caption.
        image_path: String,
        /// Optional conditioning prompt.
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    /// Score an image against candidate labels (CLIP).
    Classify {
        /// Image to classify.
        image_path: String,
        /// Candidate labels.
        texts: Vec<String>,
    },
}

/// Reply to [`VisionRequest::Caption`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CaptionResponse {
    /// Generated caption.
    pub caption: String,
    /// Inference time in seconds.
    pub latency: f32,
    /// Image that was captioned.
    pub image: String,
    /// Conditioning prompt echoed back, if any.
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Reply to [`VisionRequest::Classify`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassifyResponse {
    /// Probability per label.
    pub results: HashMap<String, f32>,
    /// Inference time in seconds.
    pub latency: f32,
    /// Image that was classified.
    pub image: String,
}
