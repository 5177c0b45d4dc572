//! Execution provider selection for `ort` sessions.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info, warn};

/// Inference backend selection.
///
/// `Tensorrt` falls back to CUDA and `Cuda` falls back to CPU when the
/// runtime libraries are missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub fn build_session(model_path: &Path, backend: &InferenceBackend) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let started = Instant::now();

    let session = match backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session on CPU");
            builder.commit_from_file(model_path)
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(model_path)
        }
        InferenceBackend::Tensorrt => {
            debug!(
                backend = "tensorrt",
                "Building session with TensorRT EP (CUDA EP fallback)"
            );
            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
        }
    }
    .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

    info!(
        model = %model_path.display(),
        %backend,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "ONNX session ready"
    );

    Ok(session)
}
