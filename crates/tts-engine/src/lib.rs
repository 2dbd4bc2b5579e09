use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod audio;
mod capability;
#[cfg(feature = "python")]
mod coqui;
mod device;

pub use audio::{encode_wav, write_wav};
pub use capability::{ModelCapability, ModelProfile};
#[cfg(feature = "python")]
pub use coqui::{CoquiRuntime, CoquiRuntimeConfig};
pub use device::{Device, DevicePolicy};

#[derive(Debug, Error)]
pub enum TtsEngineError {
    #[error("synthesis runtime unavailable: {0}")]
    Unavailable(String),
    #[error("failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },
    #[error("render failed: {0}")]
    Render(String),
    #[cfg(feature = "python")]
    #[error(transparent)]
    Python(#[from] pyo3::PyErr),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, TtsEngineError>;

/// One concrete call into a loaded model. The dispatcher picks the variant;
/// the engine only executes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RenderPlan {
    /// Direct cloning from reference audio.
    Clone {
        text: String,
        reference: PathBuf,
        language: String,
    },
    /// Default synthesis followed by conversion into the reference voice.
    CloneViaConversion { text: String, reference: PathBuf },
    Speaker {
        text: String,
        speaker: String,
        language: Option<String>,
    },
    Default {
        text: String,
        language: Option<String>,
    },
    /// Audio-to-audio conversion, no text involved.
    Convert { source: PathBuf, target: PathBuf },
}

impl RenderPlan {
    pub const fn strategy(&self) -> &'static str {
        match self {
            RenderPlan::Clone { .. } => "clone",
            RenderPlan::CloneViaConversion { .. } => "clone_via_conversion",
            RenderPlan::Speaker { .. } => "speaker",
            RenderPlan::Default { .. } => "default",
            RenderPlan::Convert { .. } => "convert",
        }
    }
}

/// A model that has been constructed and moved onto its device.
#[async_trait]
pub trait TtsModel: Send + Sync {
    fn name(&self) -> &str;
    fn profile(&self) -> &ModelProfile;
    /// Runs the plan and writes the audio to `output`. Blocking engines must
    /// move the work off the async executor.
    async fn render(&self, plan: RenderPlan, output: &Path) -> EngineResult<()>;
}

/// Entry point into a synthesis backend.
#[async_trait]
pub trait TtsRuntime: Send + Sync {
    fn label(&self) -> &'static str;
    fn accelerator_available(&self) -> bool;
    async fn load(&self, model_name: &str, device: Device) -> EngineResult<Arc<dyn TtsModel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_serializes_with_strategy_tag() {
        let plan = RenderPlan::Speaker {
            text: "hi".into(),
            speaker: "p225".into(),
            language: None,
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["strategy"], "speaker");
        assert_eq!(plan.strategy(), "speaker");
    }
}
