//! Image restoration capability.
//!
//! The background job only sees [`Restorer`]; the production implementation
//! is [`onnx::OnnxRestorer`], tests plug in deterministic stubs.

pub mod backend;
pub mod onnx;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Output size relative to the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScaleFactor {
    /// Restore only, keep the source dimensions.
    X1,
    /// Restore and upscale 2x.
    X2,
}

impl ScaleFactor {
    pub fn factor(self) -> u32 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
        }
    }
}

impl TryFrom<u32> for ScaleFactor {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::X1),
            2 => Ok(Self::X2),
            other => anyhow::bail!("unsupported scale factor {other} (expected 1 or 2)"),
        }
    }
}

/// Turns encoded image bytes into restored, re-encoded image bytes.
///
/// Implementations are blocking; callers run them on a blocking thread.
pub trait Restorer: Send + Sync {
    fn restore(&self, image: &[u8], scale: ScaleFactor) -> Result<Vec<u8>>;
}
