pub mod agent;
pub mod config;
pub mod errors;
pub mod recognition;

use std::sync::Arc;
use std::time::Duration;

use crate::agent::ffi::MaaApi;
use crate::agent::maa::MaaAgentBackend;
use crate::agent::server::AgentServer;
use crate::config::AppConfig;
use crate::errors::TowerResult;
use crate::recognition::registry::RecognitionRegistry;

const USAGE: &str = "Usage: towerpick <socket_id>\nsocket_id is provided by the host's agent identifier.";

/// Process entry point. `args` is the full argv; the last element is the
/// socket identifier. Returns the exit status.
pub fn run(args: Vec<String>) -> i32 {
    if args.len() < 2 {
        eprintln!("{USAGE}");
        return 1;
    }
    let socket_id = args[args.len() - 1].clone();

    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();

    let (config, config_path) = match config::load_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return 2;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match &config_path {
        Some(path) => tracing::info!(path = %path.display(), "config loaded"),
        None => tracing::info!("no towerpick.toml found, using defaults"),
    }

    let api = match MaaApi::load(config.agent.library_dir.as_deref()) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            tracing::error!(error = %e, "failed to load the agent-server library");
            return 2;
        }
    };
    if let Err(e) = api.init_toolkit(&config.agent.user_path) {
        tracing::warn!(error = %e, user_path = %config.agent.user_path, "toolkit options not initialized");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            return 2;
        }
    };

    let status = match serve_agent(&runtime, api, &config, &socket_id) {
        Ok(()) => {
            tracing::info!("agent exited");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "agent failed");
            2
        }
    };
    runtime.shutdown_timeout(Duration::from_secs(2));
    status
}

fn serve_agent(
    runtime: &tokio::runtime::Runtime,
    api: Arc<MaaApi>,
    config: &AppConfig,
    socket_id: &str,
) -> TowerResult<()> {
    let registry = RecognitionRegistry::from_config(config);
    tracing::info!(
        socket_id = %socket_id,
        recognitions = ?registry.list_names(),
        "starting agent server"
    );

    let mut server = AgentServer::new(MaaAgentBackend::new(api)?, registry);
    server.start_up(socket_id)?;
    let joined = runtime.block_on(server.join());
    server.shut_down();
    joined
}
