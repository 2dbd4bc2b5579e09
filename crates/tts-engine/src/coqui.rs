use std::{
    collections::HashSet,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use async_trait::async_trait;
use numpy::{PyArray1, PyArrayMethods, PyReadonlyArray1};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pyo3::{
    types::{PyDict, PyModule},
    IntoPy, Py, PyAny, PyResult, Python,
};
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{debug, info, instrument};

use crate::{
    audio::write_wav, Device, EngineResult, ModelProfile, RenderPlan, TtsEngineError, TtsModel,
    TtsRuntime,
};

static PYTHONPATH_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static PYTHONPATH_ENTRIES: Lazy<Mutex<HashSet<OsString>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));
const FALLBACK_SAMPLE_RATE: u32 = 22_050;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CoquiRuntimeConfig {
    /// Extra directory prepended to PYTHONPATH before `TTS.api` is imported.
    #[serde(default)]
    pub python_package_path: Option<PathBuf>,
    #[serde(default)]
    pub progress_bar: bool,
}

/// Coqui TTS hosted in the embedded Python interpreter.
pub struct CoquiRuntime {
    accelerator: bool,
    progress_bar: bool,
}

struct CoquiModel {
    name: String,
    profile: ModelProfile,
    handle: Arc<Mutex<Py<PyAny>>>,
}

fn ensure_python_path(path: &Path) -> anyhow::Result<()> {
    let canonical = path.to_path_buf();
    let os_path = canonical.as_os_str().to_os_string();

    let _guard = PYTHONPATH_LOCK.lock();
    let mut entries = PYTHONPATH_ENTRIES.lock();
    if entries.contains(&os_path) {
        return Ok(());
    }

    let mut current_paths: Vec<PathBuf> = std::env::var_os("PYTHONPATH")
        .map(|existing| std::env::split_paths(&existing).collect())
        .unwrap_or_default();
    if !current_paths.iter().any(|p| p == &canonical) {
        current_paths.push(canonical.clone());
    }

    let joined = std::env::join_paths(current_paths).context("failed to construct PYTHONPATH")?;
    std::env::set_var("PYTHONPATH", joined);
    entries.insert(os_path);
    Ok(())
}

impl CoquiRuntime {
    pub fn new(config: CoquiRuntimeConfig) -> EngineResult<Self> {
        if let Some(ref path) = config.python_package_path {
            let canonical = path
                .canonicalize()
                .context("failed to canonicalize python package path")?;
            ensure_python_path(&canonical)?;
        }

        let accelerator = Python::with_gil(|py| -> PyResult<bool> {
            PyModule::import(py, "TTS.api")?;
            let torch = PyModule::import(py, "torch")?;
            torch
                .getattr("cuda")?
                .call_method0("is_available")?
                .extract()
        })
        .map_err(|err| TtsEngineError::Unavailable(format!("Coqui TTS import failed: {err}")))?;

        info!(
            target = "tts_gateway::tts_engine",
            accelerator,
            "Coqui TTS runtime imported"
        );

        Ok(Self {
            accelerator,
            progress_bar: config.progress_bar,
        })
    }
}

#[async_trait]
impl TtsRuntime for CoquiRuntime {
    fn label(&self) -> &'static str {
        "coqui_tts"
    }

    fn accelerator_available(&self) -> bool {
        self.accelerator
    }

    #[instrument(skip(self))]
    async fn load(&self, model_name: &str, device: Device) -> EngineResult<Arc<dyn TtsModel>> {
        let name = model_name.to_string();
        let progress_bar = self.progress_bar;
        let model = task::spawn_blocking(move || CoquiModel::load(name, device, progress_bar))
            .await
            .map_err(|err| TtsEngineError::Other(err.into()))??;
        Ok(Arc::new(model))
    }
}

impl CoquiModel {
    fn load(name: String, device: Device, progress_bar: bool) -> EngineResult<Self> {
        let started = Instant::now();
        let loaded = Python::with_gil(
            |py| -> PyResult<(Py<PyAny>, Option<Vec<String>>, Option<Vec<String>>)> {
                let module = PyModule::import(py, "TTS.api")?;
                let cls = module.getattr("TTS")?;
                let kwargs = PyDict::new(py);
                kwargs.set_item("model_name", name.as_str())?;
                kwargs.set_item("progress_bar", progress_bar)?;
                let tts = cls
                    .call((), Some(kwargs))?
                    .call_method1("to", (device.as_str(),))?;
                let speakers = optional_string_list(tts, "speakers");
                let languages = optional_string_list(tts, "languages");
                Ok((tts.into_py(py), speakers, languages))
            },
        );

        let (handle, speakers, languages) = loaded.map_err(|err| TtsEngineError::ModelLoad {
            model: name.clone(),
            reason: err.to_string(),
        })?;
        let profile = ModelProfile::infer(&name, speakers, languages);

        info!(
            target = "tts_gateway::tts_engine",
            model = %name,
            %device,
            capability = %profile.capability,
            multilingual = profile.multilingual,
            elapsed_ms = started.elapsed().as_millis(),
            "Coqui model loaded"
        );

        Ok(Self {
            name,
            profile,
            handle: Arc::new(Mutex::new(handle)),
        })
    }
}

#[async_trait]
impl TtsModel for CoquiModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    async fn render(&self, plan: RenderPlan, output: &Path) -> EngineResult<()> {
        let handle = self.handle.clone();
        let output = output.to_path_buf();
        task::spawn_blocking(move || {
            let guard = handle.lock();
            render_blocking(&guard, plan, &output)
        })
        .await
        .map_err(|err| TtsEngineError::Other(err.into()))?
    }
}

fn render_blocking(handle: &Py<PyAny>, plan: RenderPlan, output: &Path) -> EngineResult<()> {
    debug!(
        target = "tts_gateway::tts_engine",
        strategy = plan.strategy(),
        output = %output.display(),
        "rendering"
    );

    Python::with_gil(|py| -> EngineResult<()> {
        let tts = handle.as_ref(py);
        let kwargs = PyDict::new(py);
        kwargs.set_item("file_path", output.as_os_str())?;

        match plan {
            RenderPlan::Clone {
                text,
                reference,
                language,
            } => {
                kwargs.set_item("text", text)?;
                kwargs.set_item("speaker_wav", reference.as_os_str())?;
                kwargs.set_item("language", language)?;
                tts.call_method("tts_to_file", (), Some(kwargs))?;
            }
            RenderPlan::CloneViaConversion { text, reference } => {
                kwargs.set_item("text", text)?;
                kwargs.set_item("speaker_wav", reference.as_os_str())?;
                tts.call_method("tts_with_vc_to_file", (), Some(kwargs))?;
            }
            RenderPlan::Speaker {
                text,
                speaker,
                language,
            } => {
                kwargs.set_item("text", text)?;
                kwargs.set_item("speaker", speaker)?;
                if let Some(language) = language {
                    kwargs.set_item("language", language)?;
                }
                tts.call_method("tts_to_file", (), Some(kwargs))?;
            }
            RenderPlan::Default { text, language } => {
                if tts.hasattr("tts_to_file")? {
                    kwargs.set_item("text", text)?;
                    if let Some(language) = language {
                        kwargs.set_item("language", language)?;
                    }
                    tts.call_method("tts_to_file", (), Some(kwargs))?;
                } else {
                    // Older model wrappers only return the waveform.
                    let call_kwargs = PyDict::new(py);
                    call_kwargs.set_item("text", text)?;
                    let wav = tts.call_method("tts", (), Some(call_kwargs))?;
                    let samples = extract_waveform(wav)?;
                    write_wav(output, &samples, output_sample_rate(tts))?;
                }
            }
            RenderPlan::Convert { source, target } => {
                kwargs.set_item("source_wav", source.as_os_str())?;
                kwargs.set_item("target_wav", target.as_os_str())?;
                tts.call_method("voice_conversion_to_file", (), Some(kwargs))?;
            }
        }
        Ok(())
    })
}

fn optional_string_list(obj: &PyAny, attr: &str) -> Option<Vec<String>> {
    let value = obj.getattr(attr).ok()?;
    if value.is_none() {
        return None;
    }
    value.extract::<Vec<String>>().ok()
}

fn output_sample_rate(tts: &PyAny) -> u32 {
    tts.getattr("synthesizer")
        .and_then(|synth| synth.getattr("output_sample_rate"))
        .and_then(|rate| rate.extract::<u32>())
        .unwrap_or(FALLBACK_SAMPLE_RATE)
}

fn extract_waveform(value: &PyAny) -> EngineResult<Vec<f32>> {
    if let Ok(array) = value.downcast::<PyArray1<f32>>() {
        let readonly: PyReadonlyArray1<f32> = array.readonly();
        return Ok(readonly.as_slice().map_err(not_contiguous)?.to_vec());
    }

    if let Ok(array) = value.downcast::<PyArray1<f64>>() {
        let readonly: PyReadonlyArray1<f64> = array.readonly();
        let waveform = readonly
            .as_slice()
            .map_err(not_contiguous)?
            .iter()
            .map(|&sample| sample as f32)
            .collect();
        return Ok(waveform);
    }

    if let Ok(list) = value.extract::<Vec<f32>>() {
        return Ok(list);
    }

    Err(TtsEngineError::Render(
        "unsupported waveform type returned by Coqui TTS".to_string(),
    ))
}

fn not_contiguous(err: impl std::fmt::Display) -> TtsEngineError {
    TtsEngineError::Render(format!("waveform is not contiguous: {err}"))
}
