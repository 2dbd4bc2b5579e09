mod cleanup;
mod config;
mod error;
mod models;
mod outputs;
mod routes;
mod synth;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use routes::{build_router, ApiState};
use synth::Synthesizer;
use tokio::signal;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use tts_engine::{TtsEngineError, TtsRuntime};

use crate::{cleanup::CleanupTask, config::AppConfig};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "HTTP gateway for Coqui text-to-speech and voice conversion (synthesis requires a `--features python` build)",
    long_about = "HTTP gateway for Coqui text-to-speech and voice conversion.\n\n\
                  Synthesis needs the Coqui runtime: build with `--features python`. \
                  Without it every synthesis route answers 503."
)]
struct Cli {
    /// Path to a TOML configuration file; defaults plus TTS_GATEWAY__* env vars otherwise
    #[arg(long)]
    config: Option<PathBuf>,
    /// Logging level (error|warn|info|debug|trace)
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Load `tts.preload_models` before accepting traffic
    #[arg(long, default_value_t = false)]
    warmup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config = AppConfig::load(cli.config.clone())?;
    config.ensure_directories()?;

    let (synthesizer, unavailable_reason) = match build_runtime(&config) {
        Ok(runtime) => (Some(Arc::new(Synthesizer::new(&config, runtime))), None),
        Err(err) => {
            error!(
                target = "tts_gateway::backend",
                %err,
                "TTS engine unavailable; synthesis routes will answer 503"
            );
            (None, Some(err.to_string()))
        }
    };

    if cli.warmup {
        if let Some(ref synth) = synthesizer {
            synth.warmup(&config.tts.preload_models).await;
        }
    }

    // nothing renders yet, so every staging entry is a leftover
    match cleanup::sweep_staging_in_background(config.staging_dir(), Duration::ZERO).await {
        Ok(report) if report.removed > 0 => info!(
            target = "tts_gateway::backend",
            removed = report.removed,
            "cleared abandoned staging entries"
        ),
        Ok(_) => {}
        Err(err) => warn!(target = "tts_gateway::backend", %err, "staging cleanup failed"),
    }

    let cleanup_task = synthesizer.as_ref().map(|_| {
        CleanupTask::spawn(
            config.storage.output_dir.clone(),
            config.staging_dir(),
            Duration::from_secs(config.cleanup.interval_secs),
            cleanup::hours(config.cleanup.max_age_hours),
        )
    });

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .context("host and port must form a valid socket address")?;
    let api_state = ApiState {
        synthesizer,
        config: Arc::new(config),
        unavailable_reason,
    };

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::WARN));

    let app = build_router(api_state).layer(trace_layer);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!(target = "tts_gateway::backend", %addr, "gateway ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = cleanup_task {
        task.shutdown().await;
    }
    info!(target = "tts_gateway::backend", "shutdown complete");
    Ok(())
}

#[cfg(feature = "python")]
fn build_runtime(config: &AppConfig) -> Result<Arc<dyn TtsRuntime>, TtsEngineError> {
    use tts_engine::{CoquiRuntime, CoquiRuntimeConfig};

    let runtime = CoquiRuntime::new(CoquiRuntimeConfig {
        python_package_path: config.tts.python_package_path.clone(),
        progress_bar: false,
    })?;
    Ok(Arc::new(runtime))
}

#[cfg(not(feature = "python"))]
fn build_runtime(_config: &AppConfig) -> Result<Arc<dyn TtsRuntime>, TtsEngineError> {
    Err(TtsEngineError::Unavailable(
        "built without the `python` feature; rebuild with `--features python`".to_string(),
    ))
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .or_else(|_| EnvFilter::try_new(format!("tts_gateway={level}")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to initialise tracing subscriber: {err}"))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target = "tts_gateway::backend", "shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn help_names_the_python_feature() {
        let mut command = Cli::command();
        assert!(command.render_help().to_string().contains("--features python"));
        assert!(command.render_long_help().to_string().contains("answers 503"));
    }

    #[test]
    fn config_file_is_optional() {
        let cli = Cli::try_parse_from(["tts-gateway", "--warmup"]).unwrap();
        assert!(cli.config.is_none());
        assert!(cli.warmup);
        assert_eq!(cli.log_level, "info");
    }
}
