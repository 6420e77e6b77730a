use backend_selector::server::{serve, shutdown_signal, spawn_status_reporter};
use backend_selector::{Config, Registry, Selector};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIG_FILE_PATH.into());

    let config = Config::load_from_file(&path)
        .and_then(Config::into_runtime)
        .unwrap_or_else(|e| {
            error!(%e, "fatal");
            std::process::exit(1);
        });

    let registry = Registry::from_addrs(&config.backends);
    let selector = Selector::new(registry, config.selector);

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        error!(listen = %config.listen, %e, "failed to bind");
        std::process::exit(1);
    });

    info!(
        listen = %config.listen,
        algorithm = %selector.algorithm(),
        backends = selector.registry().len(),
        threshold = config.selector.passive_failure_threshold,
        fail_timeout_secs = config.selector.fail_timeout.as_secs(),
        "listening"
    );

    if let Some(interval) = config.status_interval {
        spawn_status_reporter(selector.clone(), interval);
    }

    serve(listener, selector, config.connect_timeout, shutdown_signal()).await;
}
