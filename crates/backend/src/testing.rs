//! In-process stand-in for the synthesis runtime used by the unit tests.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tts_engine::{
    Device, EngineResult, ModelProfile, RenderPlan, TtsEngineError, TtsModel, TtsRuntime,
};

use crate::config::AppConfig;

pub const FAKE_AUDIO: &[u8] = b"RIFF....WAVEfake";

#[derive(Default)]
pub struct FakeRuntime {
    pub accelerator: bool,
    load_delay: Duration,
    render_delay: Duration,
    loads: AtomicUsize,
    failing_loads: AtomicUsize,
    renders: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    plans: Arc<Mutex<Vec<RenderPlan>>>,
    devices: Mutex<Vec<Device>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delays(load_delay: Duration, render_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            load_delay,
            render_delay,
            ..Self::default()
        })
    }

    pub fn with_accelerator() -> Arc<Self> {
        Arc::new(Self {
            accelerator: true,
            ..Self::default()
        })
    }

    pub fn fail_next_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    /// Highest number of renders observed running at the same time.
    pub fn peak_concurrent_renders(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn plans(&self) -> Vec<RenderPlan> {
        self.plans.lock().clone()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.lock().clone()
    }
}

fn list(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|value| value.to_string()).collect())
}

/// Metadata roughly matching what the real models expose.
pub fn profile_for(model_name: &str) -> ModelProfile {
    let (speakers, languages) = if model_name.contains("xtts") {
        (None, list(&["en", "de", "fr"]))
    } else if model_name.contains("your_tts") {
        (list(&["female-en-5", "male-en-2"]), list(&["en", "fr-fr", "pt-br"]))
    } else if model_name.contains("vctk/vits") || model_name.contains("vctk/fast_pitch") {
        (list(&["p225", "p226"]), None)
    } else {
        (None, None)
    };
    ModelProfile::infer(model_name, speakers, languages)
}

#[async_trait]
impl TtsRuntime for FakeRuntime {
    fn label(&self) -> &'static str {
        "fake_tts"
    }

    fn accelerator_available(&self) -> bool {
        self.accelerator
    }

    async fn load(&self, model_name: &str, device: Device) -> EngineResult<Arc<dyn TtsModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.devices.lock().push(device);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        let should_fail = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TtsEngineError::ModelLoad {
                model: model_name.to_string(),
                reason: "weights missing".into(),
            });
        }
        Ok(Arc::new(FakeModel {
            name: model_name.to_string(),
            profile: profile_for(model_name),
            render_delay: self.render_delay,
            renders: self.renders.clone(),
            active: self.active.clone(),
            peak: self.peak.clone(),
            plans: self.plans.clone(),
        }))
    }
}

struct FakeModel {
    name: String,
    profile: ModelProfile,
    render_delay: Duration,
    renders: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    plans: Arc<Mutex<Vec<RenderPlan>>>,
}

struct ActiveRender(Arc<AtomicUsize>);

impl Drop for ActiveRender {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TtsModel for FakeModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    async fn render(&self, plan: RenderPlan, output: &Path) -> EngineResult<()> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _active = ActiveRender(self.active.clone());
        self.plans.lock().push(plan.clone());
        if !self.render_delay.is_zero() {
            tokio::time::sleep(self.render_delay).await;
        }
        if let RenderPlan::Default { ref text, .. } = plan {
            if text.contains("explode") {
                // leave a partial file behind to prove it never gets published
                tokio::fs::write(output, b"partial").await?;
                return Err(TtsEngineError::Render("device out of memory".into()));
            }
            if text.contains("silent") {
                return Ok(());
            }
        }
        tokio::fs::write(output, FAKE_AUDIO).await?;
        Ok(())
    }
}

/// Default settings rooted in a scratch directory, with the bundled
/// reference audio present.
pub fn test_config(root: &Path) -> AppConfig {
    let mut cfg: AppConfig = config::Config::builder()
        .build()
        .unwrap()
        .try_deserialize()
        .unwrap();
    cfg.storage.output_dir = root.join("outputs");
    cfg.storage.cache_dir = root.join("cache");
    let reference = root.join("harvard.wav");
    std::fs::write(&reference, FAKE_AUDIO).unwrap();
    cfg.tts.reference_audio = reference;
    cfg.ensure_directories().unwrap();
    cfg
}
