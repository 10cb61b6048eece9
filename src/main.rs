use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use flowcore::config::context::build_context;
use flowcore::config::schema::{load_config, DEFAULT_CONFIG_PATH};
use flowcore::frontend::http::run_server;

#[derive(Debug, Parser)]
#[clap(name = "flowcore", version, about = "Tables and HTTP endpoints declared at runtime")]
struct Args {
    #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,

    /// Emit logs as JSON lines
    #[clap(long)]
    json_logs: bool,
}

fn prepare_tracing(json_logs: bool) {
    // Redirect all `log` records (e.g. warp's request log) to tracing
    LogTracer::init().expect("Failed to set up the log -> tracing bridge");

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowcore=info,warp=info"));
    let registry = Registry::default().with(env_filter);

    let result = if json_logs {
        tracing::subscriber::set_global_default(
            registry.with(tracing_subscriber::fmt::layer().json()),
        )
    } else {
        tracing::subscriber::set_global_default(registry.with(tracing_subscriber::fmt::layer()))
    };
    result.expect("Failed to set up the tracing subscriber");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                error!("Could not listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutting down");
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    prepare_tracing(args.json_logs);

    info!("Starting flowcore {}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading the config from {:?}: {e}", args.config_path);
            process::exit(1);
        }
    };
    let http = config.frontend.http.clone();

    let context = match build_context(config).await {
        Ok(context) => Some(Arc::new(context)),
        Err(e) => {
            error!("Could not set up the catalog database, serving in degraded mode: {e}");
            None
        }
    };

    run_server(context, http, shutdown_signal()).await;
}
