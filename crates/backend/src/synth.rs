use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use tts_engine::{Device, ModelCapability, ModelProfile, RenderPlan, TtsModel, TtsRuntime};

use crate::{
    config::AppConfig,
    error::{ServiceError, ServiceResult},
    models::ModelCache,
    outputs::{digest_file, Artifact, ArtifactKind, CacheKey, OutputCache},
};

/// A text-to-speech job.
#[derive(Clone, Debug)]
pub struct SynthesisRequest {
    pub text: String,
    /// Falls back to the configured default model.
    pub model_name: Option<String>,
    pub speaker: Option<String>,
    /// Audio whose voice should be cloned.
    pub speaker_reference: Option<PathBuf>,
    pub language: Option<String>,
    pub output_format: String,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model_name: None,
            speaker: None,
            speaker_reference: None,
            language: None,
            output_format: "wav".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub capability: ModelCapability,
    pub device: Device,
    pub is_multi_speaker: bool,
    pub is_multi_lingual: bool,
    pub speakers: Option<Vec<String>>,
    pub languages: Option<Vec<String>>,
}

struct Limits {
    default_model: String,
    voice_conversion_model: String,
    available_models: Vec<String>,
    allowed_formats: Vec<String>,
    max_text_length: usize,
}

/// Validates jobs, picks a render strategy per model and serves results
/// through the output cache.
pub struct Synthesizer {
    limits: Limits,
    models: Arc<ModelCache>,
    outputs: Arc<OutputCache>,
    limiter: Arc<Semaphore>,
}

impl Synthesizer {
    pub fn new(config: &AppConfig, runtime: Arc<dyn TtsRuntime>) -> Self {
        let device = config
            .tts
            .device
            .resolve(runtime.accelerator_available());
        info!(
            target = "tts_gateway::synth",
            engine = runtime.label(),
            %device,
            max_workers = config.api.max_workers,
            "synthesizer ready"
        );

        Self {
            limits: Limits {
                default_model: config.tts.default_model.clone(),
                voice_conversion_model: config.tts.voice_conversion_model.clone(),
                available_models: config.tts.available_models.clone(),
                allowed_formats: config
                    .api
                    .allowed_audio_formats
                    .iter()
                    .map(|format| format.to_ascii_lowercase())
                    .collect(),
                max_text_length: config.api.max_text_length,
            },
            models: Arc::new(ModelCache::new(
                runtime,
                device,
                config.tts.max_resident_models,
            )),
            outputs: Arc::new(OutputCache::new(
                config.storage.output_dir.clone(),
                config.staging_dir(),
            )),
            limiter: Arc::new(Semaphore::new(config.api.max_workers.max(1))),
        }
    }

    pub fn device(&self) -> Device {
        self.models.device()
    }

    pub fn engine_label(&self) -> &'static str {
        self.models.runtime_label()
    }

    pub fn loaded_models_count(&self) -> usize {
        self.models.loaded_count()
    }

    pub fn available_models(&self) -> &[String] {
        &self.limits.available_models
    }

    pub fn default_model(&self) -> &str {
        &self.limits.default_model
    }

    pub fn output_dir(&self) -> &Path {
        self.outputs.output_dir()
    }

    #[instrument(skip(self, request), fields(model = tracing::field::Empty, chars = request.text.chars().count()))]
    pub async fn synthesize(&self, request: SynthesisRequest) -> ServiceResult<Artifact> {
        let SynthesisRequest {
            text,
            model_name,
            speaker,
            speaker_reference,
            language,
            output_format,
        } = request;

        if text.trim().is_empty() {
            return Err(ServiceError::validation("Text cannot be empty"));
        }
        let chars = text.chars().count();
        if chars > self.limits.max_text_length {
            return Err(ServiceError::validation(format!(
                "Text too long. Maximum length is {} characters, got {chars}",
                self.limits.max_text_length
            )));
        }
        let format = self.check_format(&output_format)?;
        let model_name = model_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.limits.default_model.clone());
        tracing::Span::current().record("model", model_name.as_str());
        self.check_model(&model_name)?;
        if let Some(ref reference) = speaker_reference {
            if !is_file(reference).await {
                return Err(ServiceError::validation(format!(
                    "Speaker wav file not found: {}",
                    reference.display()
                )));
            }
        }
        let speaker = speaker.filter(|id| !id.trim().is_empty());
        let language = language.filter(|lang| !lang.trim().is_empty());

        let key = CacheKey::for_speech(
            &text,
            &model_name,
            speaker.as_deref(),
            speaker_reference.as_deref(),
            language.as_deref(),
        );
        let started = Instant::now();
        let models = Arc::clone(&self.models);
        let limiter = Arc::clone(&self.limiter);
        let artifact = self
            .outputs
            .produce(ArtifactKind::Speech, key, &format, move |staged| async move {
                let model = models.get_or_load(&model_name).await?;
                let plan = plan_for(
                    model.profile(),
                    &model_name,
                    text,
                    speaker,
                    speaker_reference,
                    language,
                )?;
                render(&limiter, model.as_ref(), plan, &staged).await
            })
            .await?;

        info!(
            target = "tts_gateway::synth",
            cache_hit = artifact.cache_hit,
            elapsed_ms = started.elapsed().as_millis(),
            file = %artifact.path.display(),
            "speech ready"
        );
        Ok(artifact)
    }

    /// Re-voices `source` with the timbre of `target`.
    #[instrument(skip(self, source, target))]
    pub async fn convert_voice(
        &self,
        source: &Path,
        target: &Path,
        model_name: Option<&str>,
        output_format: &str,
    ) -> ServiceResult<Artifact> {
        let format = self.check_format(output_format)?;
        let model_name = model_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(self.limits.voice_conversion_model.as_str())
            .to_string();
        self.check_model(&model_name)?;
        for (role, path) in [("Source", source), ("Target", target)] {
            if !is_file(path).await {
                return Err(ServiceError::validation(format!(
                    "{role} wav file not found: {}",
                    path.display()
                )));
            }
        }

        let source_digest = digest_file(source)
            .await
            .map_err(|err| ServiceError::Internal(err.into()))?;
        let target_digest = digest_file(target)
            .await
            .map_err(|err| ServiceError::Internal(err.into()))?;
        let key = CacheKey::for_conversion(&source_digest, &target_digest, &model_name);

        let models = Arc::clone(&self.models);
        let limiter = Arc::clone(&self.limiter);
        let (source, target) = (source.to_path_buf(), target.to_path_buf());
        let artifact = self
            .outputs
            .produce(ArtifactKind::Conversion, key, &format, move |staged| async move {
                let model = models.get_or_load(&model_name).await?;
                if model.profile().capability != ModelCapability::VoiceConversionOnly {
                    return Err(ServiceError::validation(format!(
                        "Model {model_name} does not perform voice conversion"
                    )));
                }
                let plan = RenderPlan::Convert { source, target };
                render(&limiter, model.as_ref(), plan, &staged).await
            })
            .await?;

        info!(
            target = "tts_gateway::synth",
            cache_hit = artifact.cache_hit,
            file = %artifact.path.display(),
            "voice conversion ready"
        );
        Ok(artifact)
    }

    pub async fn model_info(&self, model_name: &str) -> ServiceResult<ModelInfo> {
        self.check_model(model_name)?;
        let model = self.models.get_or_load(model_name).await?;
        let profile = model.profile();
        Ok(ModelInfo {
            model_name: model_name.to_string(),
            capability: profile.capability,
            device: self.device(),
            is_multi_speaker: profile.is_multi_speaker(),
            is_multi_lingual: profile.multilingual,
            speakers: profile.speakers.clone(),
            languages: profile.languages.clone(),
        })
    }

    /// Loads each model ahead of traffic. Failures are logged and skipped.
    pub async fn warmup(&self, model_names: &[String]) {
        for name in model_names {
            let result = match self.check_model(name) {
                Ok(()) => self.models.get_or_load(name).await.map(|_| ()),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => info!(target = "tts_gateway::synth", model = %name, "warmup complete"),
                Err(err) => {
                    warn!(target = "tts_gateway::synth", model = %name, %err, "warmup failed")
                }
            }
        }
    }

    fn check_model(&self, model_name: &str) -> ServiceResult<()> {
        if self
            .limits
            .available_models
            .iter()
            .any(|name| name == model_name)
        {
            Ok(())
        } else {
            Err(ServiceError::validation(format!(
                "Model {model_name} not available. Available models: {}",
                self.limits.available_models.join(", ")
            )))
        }
    }

    fn check_format(&self, output_format: &str) -> ServiceResult<String> {
        let format = output_format
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        if self.limits.allowed_formats.contains(&format) {
            Ok(format)
        } else {
            Err(ServiceError::validation(format!(
                "Unsupported output format '{output_format}'. Allowed formats: {}",
                self.limits.allowed_formats.join(", ")
            )))
        }
    }
}

/// Runs one plan while holding a worker permit. Called from the output
/// cache's fill task, so the permit outlives a disconnected caller.
async fn render(
    limiter: &Semaphore,
    model: &dyn TtsModel,
    plan: RenderPlan,
    staged: &Path,
) -> ServiceResult<()> {
    let _permit = limiter
        .acquire()
        .await
        .map_err(|_| ServiceError::Unavailable)?;
    let strategy = plan.strategy();
    let started = Instant::now();
    model
        .render(plan, staged)
        .await
        .map_err(ServiceError::from_render)?;
    info!(
        target = "tts_gateway::synth",
        model = model.name(),
        strategy,
        elapsed_ms = started.elapsed().as_millis(),
        "render finished"
    );
    Ok(())
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Chooses how a model should voice a job from what the model supports.
pub fn plan_for(
    profile: &ModelProfile,
    model_name: &str,
    text: String,
    speaker: Option<String>,
    reference: Option<PathBuf>,
    language: Option<String>,
) -> ServiceResult<RenderPlan> {
    if !profile.capability.reads_text() {
        return Err(ServiceError::validation(format!(
            "Model {model_name} only performs voice conversion and cannot synthesize text"
        )));
    }

    if let Some(reference) = reference {
        return Ok(match profile.capability {
            ModelCapability::DirectCloning => RenderPlan::Clone {
                text,
                reference,
                language: language.unwrap_or_else(|| "en".to_string()),
            },
            _ => RenderPlan::CloneViaConversion { text, reference },
        });
    }

    // single-speaker models ignore a speaker id
    if let Some(speaker) = speaker.filter(|_| profile.is_multi_speaker()) {
        if !profile.has_speaker(&speaker) {
            return Err(ServiceError::validation(format!(
                "Unknown speaker '{speaker}' for model {model_name}"
            )));
        }
        return Ok(RenderPlan::Speaker {
            text,
            speaker,
            language: language.filter(|_| profile.multilingual),
        });
    }

    Ok(RenderPlan::Default {
        text,
        language: language.filter(|_| profile.multilingual),
    })
}
