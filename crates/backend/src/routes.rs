use std::{future::Future, path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    extract::{
        multipart::{Field, MultipartRejection},
        rejection::{FormRejection, JsonRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    cleanup::{self, sweep_in_background},
    config::AppConfig,
    error::{ApiError, ServiceError, ServiceResult},
    outputs::Artifact,
    synth::{ModelInfo, SynthesisRequest, Synthesizer},
};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const UPLOAD_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg", "m4a", "opus"];

#[derive(Clone)]
pub struct ApiState {
    /// `None` when the engine failed to start; every synthesis route then
    /// answers 503.
    pub synthesizer: Option<Arc<Synthesizer>>,
    pub config: Arc<AppConfig>,
    pub unavailable_reason: Option<String>,
}

impl ApiState {
    fn service(&self) -> Result<Arc<Synthesizer>, ApiError> {
        self.synthesizer
            .clone()
            .ok_or(ApiError(ServiceError::Unavailable))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    device: String,
    loaded_models_count: usize,
    tts_engine: &'static str,
    tts_available: bool,
    version: String,
}

#[derive(Serialize)]
struct UnhealthyResponse {
    status: &'static str,
    error: String,
    tts_available: bool,
}

#[derive(Serialize)]
struct CompatibilityResponse {
    service_version: String,
    tts_available: bool,
    tts_service_ready: bool,
    tts_engine: Option<&'static str>,
    device: Option<String>,
    status: &'static str,
    recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TtsForm {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SynthesizePayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub max_age_hours: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    message: String,
    removed: usize,
    failed: usize,
}

async fn root(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "app_name": state.config.app_name,
        "version": state.config.app_version,
        "status": "running",
        "endpoints": {
            "health": "GET /health",
            "compatibility": "GET /compatibility",
            "models": "GET /models",
            "model_info": "GET /models/{model_name}",
            "tts": "POST /tts",
            "synthesize": "POST /synthesize",
            "voice_conversion": "POST /voice-conversion",
            "cleanup": "DELETE /cleanup",
        },
    }))
}

#[instrument(skip(state))]
async fn health(State(state): State<ApiState>) -> Response {
    match state.synthesizer {
        Some(ref synth) => Json(HealthResponse {
            status: "healthy",
            device: synth.device().to_string(),
            loaded_models_count: synth.loaded_models_count(),
            tts_engine: synth.engine_label(),
            tts_available: true,
            version: state.config.app_version.clone(),
        })
        .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(UnhealthyResponse {
                status: "unhealthy",
                error: state
                    .unavailable_reason
                    .clone()
                    .unwrap_or_else(|| ServiceError::Unavailable.to_string()),
                tts_available: false,
            }),
        )
            .into_response(),
    }
}

async fn compatibility(State(state): State<ApiState>) -> Json<CompatibilityResponse> {
    let synth = state.synthesizer.as_ref();
    let mut recommendations = Vec::new();
    match synth {
        None => {
            recommendations.push(
                "Install Coqui TTS into the Python environment and build with the `python` feature"
                    .to_string(),
            );
            if let Some(ref reason) = state.unavailable_reason {
                recommendations.push(format!("Startup error: {reason}"));
            }
        }
        Some(synth) if synth.device() == tts_engine::Device::Cpu => {
            recommendations
                .push("No accelerator detected; synthesis runs on CPU and will be slow".to_string());
        }
        Some(_) => {}
    }
    if !state.config.tts.reference_audio.is_file() {
        recommendations.push(format!(
            "Reference audio {} is missing; POST /tts will fail",
            state.config.tts.reference_audio.display()
        ));
    }

    Json(CompatibilityResponse {
        service_version: state.config.app_version.clone(),
        tts_available: synth.is_some(),
        tts_service_ready: synth.is_some(),
        tts_engine: synth.map(|s| s.engine_label()),
        device: synth.map(|s| s.device().to_string()),
        status: if synth.is_some() { "ready" } else { "not_ready" },
        recommendations,
    })
}

async fn list_models(State(state): State<ApiState>) -> Result<Json<Vec<String>>, ApiError> {
    let synth = state.service()?;
    Ok(Json(synth.available_models().to_vec()))
}

#[instrument(skip(state))]
async fn model_info(
    State(state): State<ApiState>,
    Path(model_name): Path<String>,
) -> Result<Json<ModelInfo>, ApiError> {
    let synth = state.service()?;
    check_model_name(&model_name)?;
    Ok(Json(synth.model_info(&model_name).await?))
}

/// Clones the bundled reference voice.
#[instrument(skip(state, form), fields(request_id = %Uuid::new_v4()))]
async fn voice_clone_tts(
    State(state): State<ApiState>,
    form: Result<Form<TtsForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let synth = state.service()?;
    let Form(form) = form.map_err(|rejection| rejected(rejection.body_text()))?;
    let reference = state.config.tts.reference_audio.clone();
    if !fs::metadata(&reference)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
    {
        return Err(ServiceError::Synthesis(format!(
            "Reference audio not found: {}",
            reference.display()
        ))
        .into());
    }

    let language = non_empty(form.language).unwrap_or_else(|| state.config.tts.default_language.clone());
    let request = SynthesisRequest {
        text: form.text,
        model_name: non_empty(form.model_name),
        speaker: None,
        speaker_reference: Some(reference.clone()),
        language: Some(language.clone()),
        output_format: non_empty(form.output_format).unwrap_or_else(|| "wav".to_string()),
    };
    let (artifact, data) = produce_and_read(|| synth.synthesize(request.clone())).await?;

    let stem = reference
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("voice");
    let filename = download_name(&["tts", stem, &language], &artifact);
    audio_response(data, &artifact, &filename)
}

#[instrument(skip(state, payload), fields(request_id = %Uuid::new_v4()))]
async fn synthesize(
    State(state): State<ApiState>,
    payload: Result<Json<SynthesizePayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let synth = state.service()?;
    let Json(payload) = payload.map_err(|rejection| rejected(rejection.body_text()))?;
    let model_name = non_empty(payload.model_name);
    let language = non_empty(payload.language);
    let request = SynthesisRequest {
        text: payload.text,
        model_name: model_name.clone(),
        speaker: non_empty(payload.speaker),
        speaker_reference: None,
        language: language.clone(),
        output_format: non_empty(payload.output_format).unwrap_or_else(|| "wav".to_string()),
    };
    let (artifact, data) = produce_and_read(|| synth.synthesize(request.clone())).await?;

    let model = model_name.as_deref().unwrap_or(synth.default_model());
    let model_slug = model.rsplit('/').next().unwrap_or(model);
    let filename = download_name(
        &["tts", model_slug, language.as_deref().unwrap_or("default")],
        &artifact,
    );
    audio_response(data, &artifact, &filename)
}

#[instrument(skip(state, multipart), fields(request_id = %Uuid::new_v4()))]
async fn voice_conversion(
    State(state): State<ApiState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let synth = state.service()?;
    let mut multipart = multipart.map_err(|rejection| rejected(rejection.body_text()))?;
    // removed on drop, whichever way this handler exits
    let uploads = tempfile::Builder::new()
        .prefix("vc_upload_")
        .tempdir_in(&state.config.storage.cache_dir)
        .map_err(|err| ServiceError::Internal(err.into()))?;

    let mut source: Option<PathBuf> = None;
    let mut target: Option<PathBuf> = None;
    let mut model_name: Option<String> = None;
    let mut output_format: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ServiceError::validation(format!("Invalid multipart payload: {err}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(role @ ("source" | "target")) => {
                let extension = upload_extension(&field);
                let data = field.bytes().await.map_err(|err| {
                    ServiceError::validation(format!("Failed to read {role} audio: {err}"))
                })?;
                if data.is_empty() {
                    return Err(ServiceError::validation(format!("{role} audio is empty")).into());
                }
                if data.len() > MAX_UPLOAD_BYTES {
                    return Err(ServiceError::validation(format!(
                        "{role} audio exceeds the 10 MiB upload limit"
                    ))
                    .into());
                }
                let path = uploads.path().join(format!("{role}.{extension}"));
                fs::write(&path, &data)
                    .await
                    .map_err(|err| ServiceError::Internal(err.into()))?;
                debug!(
                    target = "tts_gateway::api",
                    role,
                    bytes = data.len(),
                    "upload stored"
                );
                if role == "source" {
                    source = Some(path);
                } else {
                    target = Some(path);
                }
            }
            Some("model_name") => model_name = Some(read_text(field).await?),
            Some("output_format") => output_format = Some(read_text(field).await?),
            _ => {}
        }
    }

    let source = source.ok_or_else(|| ServiceError::validation("Missing source audio"))?;
    let target = target.ok_or_else(|| ServiceError::validation("Missing target audio"))?;
    let format = non_empty(output_format).unwrap_or_else(|| "wav".to_string());
    let model_name = non_empty(model_name);

    let (artifact, data) = produce_and_read(|| {
        synth.convert_voice(&source, &target, model_name.as_deref(), &format)
    })
    .await?;
    let filename = download_name(&["vc"], &artifact);
    audio_response(data, &artifact, &filename)
}

#[instrument(skip(state))]
async fn cleanup_outputs(
    State(state): State<ApiState>,
    query: Result<Query<CleanupQuery>, QueryRejection>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let synth = state.service()?;
    let Query(query) = query.map_err(|rejection| rejected(rejection.body_text()))?;
    let hours = query
        .max_age_hours
        .unwrap_or(state.config.cleanup.default_on_demand_hours);
    let report =
        sweep_in_background(synth.output_dir().to_path_buf(), cleanup::hours(hours)).await?;
    info!(
        target = "tts_gateway::api",
        max_age_hours = hours,
        removed = report.removed,
        failed = report.failed,
        "on-demand cleanup"
    );
    Ok(Json(CleanupResponse {
        message: format!(
            "Removed {} files older than {hours} hours",
            report.removed
        ),
        removed: report.removed,
        failed: report.failed,
    }))
}

/// Runs `produce` and reads the artifact back. A file swept away between
/// the two steps is produced once more before giving up with 404.
async fn produce_and_read<F, Fut>(mut produce: F) -> ServiceResult<(Artifact, Vec<u8>)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<Artifact>>,
{
    let artifact = produce().await?;
    match read_artifact(&artifact).await {
        Err(ServiceError::NotFound(_)) => {
            warn!(
                target = "tts_gateway::api",
                file = %artifact.path.display(),
                "artifact removed before it was read; producing again"
            );
            let artifact = produce().await?;
            let data = read_artifact(&artifact).await?;
            Ok((artifact, data))
        }
        other => other.map(|data| (artifact, data)),
    }
}

async fn read_artifact(artifact: &Artifact) -> ServiceResult<Vec<u8>> {
    fs::read(&artifact.path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ServiceError::NotFound("Generated audio expired before it could be read".to_string())
        } else {
            ServiceError::Internal(anyhow::Error::new(err).context(format!(
                "failed to read {}",
                artifact.path.display()
            )))
        }
    })
}

fn audio_response(data: Vec<u8>, artifact: &Artifact, filename: &str) -> Result<Response, ApiError> {
    let extension = artifact
        .path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("wav");
    let content_type = audio_mime(&data, extension);
    let disposition = HeaderValue::from_str(&format!("attachment; filename*=UTF-8''{filename}"))
        .map_err(|err| ServiceError::Internal(err.into()))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header("X-Cache", if artifact.cache_hit { "hit" } else { "miss" })
        .body(Body::from(data))
        .map_err(|err| ApiError(ServiceError::Internal(err.into())))
}

/// Media type of the rendered bytes. Coqui writes WAV whatever extension
/// it is asked for, so the header follows the content.
fn audio_mime(data: &[u8], extension: &str) -> &'static str {
    match data {
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => "audio/wav",
        [b'f', b'L', b'a', b'C', ..] => "audio/flac",
        [b'O', b'g', b'g', b'S', ..] => "audio/ogg",
        [b'I', b'D', b'3', ..] => "audio/mpeg",
        [0xFF, second, ..] if second & 0xE0 == 0xE0 => "audio/mpeg",
        _ => match extension {
            "mp3" => "audio/mpeg",
            "flac" => "audio/flac",
            "ogg" => "audio/ogg",
            _ => "audio/wav",
        },
    }
}

/// `<parts>_<hash8>_<unix ts>.<ext>`, restricted to header-safe characters.
fn download_name(parts: &[&str], artifact: &Artifact) -> String {
    let extension = artifact
        .path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("wav");
    let prefix: Vec<String> = parts.iter().map(|part| sanitize(part)).collect();
    format!(
        "{}_{}_{}.{}",
        prefix.join("_"),
        artifact.key.short(),
        Utc::now().timestamp(),
        extension
    )
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' {
                ch
            } else {
                '-'
            }
        })
        .collect()
}

/// Malformed bodies and query strings get the same JSON error body as
/// every other 4xx.
fn rejected(details: String) -> ApiError {
    ApiError(ServiceError::Validation(details))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn check_model_name(name: &str) -> ServiceResult<()> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.split('/').any(|segment| segment == "..")
        || name.chars().any(char::is_control);
    if invalid {
        Err(ServiceError::validation(format!("Invalid model name '{name}'")))
    } else {
        Ok(())
    }
}

fn upload_extension(field: &Field<'_>) -> &'static str {
    let from_name = field
        .file_name()
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .and_then(|ext| UPLOAD_EXTENSIONS.iter().copied().find(|known| *known == ext));
    let from_mime = || match field.content_type() {
        Some("audio/mpeg" | "audio/mp3") => Some("mp3"),
        Some("audio/flac" | "audio/x-flac") => Some("flac"),
        Some("audio/ogg") => Some("ogg"),
        Some("audio/opus") => Some("opus"),
        Some("audio/aac" | "audio/mp4") => Some("m4a"),
        _ => None,
    };
    from_name.or_else(from_mime).unwrap_or("wav")
}

async fn read_text(field: Field<'_>) -> ServiceResult<String> {
    field
        .text()
        .await
        .map(|value| value.trim().to_string())
        .map_err(|err| ServiceError::validation(format!("Invalid form field: {err}")))
}

pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/compatibility", get(compatibility))
        .route("/models", get(list_models))
        .route("/models/*model_name", get(model_info))
        .route("/tts", post(voice_clone_tts))
        .route("/synthesize", post(synthesize))
        .route(
            "/voice-conversion",
            post(voice_conversion).layer(DefaultBodyLimit::max(2 * MAX_UPLOAD_BYTES + 64 * 1024)),
        )
        .route("/cleanup", delete(cleanup_outputs))
        .with_state(state)
        .layer(cors)
}
