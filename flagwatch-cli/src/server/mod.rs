mod config;
mod routes;
mod state;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use flagwatch_lib::{Registry, Watcher};
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use self::config::FlagwatchConfig;
use self::routes::{
    handle_delete_feature, handle_eval, handle_get_feature, handle_health, handle_list_features,
    handle_set_feature,
};
use self::state::AppState;

/// `serve` command-line values. Each one set here wins over the environment
/// and the config file.
#[derive(Debug, Default)]
pub struct ServeArgs {
    pub config_path: PathBuf,
    pub features: Option<String>,
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub no_watch: bool,
    pub debounce_ms: Option<u64>,
}

impl ServeArgs {
    fn apply(&self, config: &mut FlagwatchConfig) {
        if let Some(ref features) = self.features {
            config.watch.config = features.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref hostname) = self.hostname {
            config.server.hostname = hostname.clone();
        }
        if self.no_watch {
            config.watch.enabled = false;
        }
        if let Some(ms) = self.debounce_ms {
            config.watch.debounce_ms = ms;
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/v1/features",
            get(handle_list_features).post(handle_set_feature),
        )
        .route(
            "/v1/features/{name}",
            get(handle_get_feature).delete(handle_delete_feature),
        )
        .route("/v1/eval/{name}", get(handle_eval))
        .layer(CompressionLayer::new())
        .with_state(state)
}

/// Loads the features file. A missing file starts an empty registry; the
/// first write-back creates it.
fn load_registry(path: &Path) -> Registry {
    let registry = Registry::new();
    if !path.exists() {
        warn!(path = %path.display(), "features file not found, starting empty");
        return registry;
    }
    if let Err(e) = registry.load_file(path) {
        eprintln!("Failed to load {}: {}", path.display(), e);
        process::exit(1);
    }
    info!(path = %path.display(), count = registry.len(), "features loaded");
    registry
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, finishing in-flight requests");
}

pub async fn run_serve(args: ServeArgs) {
    // CLI args override env vars, which override the config file, which overrides defaults
    let mut config = FlagwatchConfig::load(&args.config_path);
    config.apply_env_overrides();
    args.apply(&mut config);

    init_tracing(&config.watch.log_level);

    let features_path = PathBuf::from(&config.watch.config);
    let registry = Arc::new(load_registry(&features_path));

    let cancel = CancellationToken::new();
    let watch = if config.watch.enabled {
        let watcher = Watcher::new(Arc::clone(&registry)).debounce(config.watch.debounce());
        match watcher.watch(&features_path, cancel.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("Failed to watch {}: {}", features_path.display(), e);
                process::exit(1);
            }
        }
    } else {
        None
    };

    let app = router(Arc::new(AppState::new(Arc::clone(&registry))));

    let addr = format!("{}:{}", config.server.hostname, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        });
    info!(
        features = %features_path.display(),
        watching = watch.is_some(),
        "serving on http://{}",
        addr
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // flushes a pending write-back before the watch lets go of the file
    cancel.cancel();
    if let Some(handle) = watch {
        handle.stopped().await;
    }

    if let Err(e) = served {
        eprintln!("Server error: {}", e);
        process::exit(1);
    }
    info!("server stopped");
}
