use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use offline_worker::network::build_http_client;
use offline_worker::{
    AppConfig, CacheStore, DiskCacheStore, HttpNetwork, LifecycleController, MemoryCacheStore,
    Network, Worker,
};
use tokio_util::sync::CancellationToken;

fn print_usage() {
    eprintln!("Usage: offline-worker [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <PATH>     Config file (default: platform config dir)");
    eprintln!("  --host <HOST>       Bind address (default: 127.0.0.1)");
    eprintln!("  --port <PORT>       Bind port (default: 9780)");
    eprintln!("  --cache-dir <DIR>   Persist partitions under DIR (default: in memory)");
    eprintln!("  -h, --help          Show this help");
    eprintln!();
    eprintln!("Log level is controlled by RUST_LOG (default: info).");
}

#[derive(Default)]
struct Options {
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    cache_dir: Option<PathBuf>,
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("Error: {flag} requires a value");
        std::process::exit(1);
    })
}

fn parse_args() -> Options {
    let mut opts = Options::default();
    let args: Vec<String> = env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                opts.config = Some(PathBuf::from(value_of(&args, i, "--config")));
            }
            "--host" => {
                i += 1;
                opts.host = Some(value_of(&args, i, "--host"));
            }
            "--port" => {
                i += 1;
                let raw = value_of(&args, i, "--port");
                let Ok(port) = raw.parse() else {
                    eprintln!("Error: invalid port {raw:?}");
                    std::process::exit(1);
                };
                opts.port = Some(port);
            }
            "--cache-dir" => {
                i += 1;
                opts.cache_dir = Some(PathBuf::from(value_of(&args, i, "--cache-dir")));
            }
            other => {
                eprintln!("Error: unknown argument {other:?}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    opts
}

/// Cancels `token` on SIGINT or SIGTERM (systemd sends SIGTERM).
async fn wait_for_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                log::warn!("Could not register SIGTERM handler: {e}");
                tokio::signal::ctrl_c().await.ok();
                log::info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Received SIGINT");
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> offline_worker::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = parse_args();
    let path = opts.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&path)?;
    if let Some(host) = opts.host {
        config.server.host = host;
    }
    if let Some(port) = opts.port {
        config.server.port = port;
    }
    if opts.cache_dir.is_some() {
        config.storage.cache_dir = opts.cache_dir;
    }

    let store: Arc<dyn CacheStore> = match &config.storage.cache_dir {
        Some(dir) => {
            log::info!("Storing partitions in {}", dir.display());
            Arc::new(DiskCacheStore::new(dir.clone()))
        }
        None => {
            log::info!("Storing partitions in memory");
            Arc::new(MemoryCacheStore::new())
        }
    };
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(build_http_client()?));

    let origin = config.worker.origin_url()?;
    let worker = Worker::new(config.worker.clone(), store, network)?;
    let controller = Arc::new(LifecycleController::new());

    let registration = controller.register(worker).await?;
    log::info!(
        "Worker {} registered ({:?})",
        registration.version,
        registration.state
    );
    if let Some(report) = &registration.install {
        if report.failures() > 0 {
            log::warn!("Install finished with {} failure(s)", report.failures());
        }
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    offline_worker::api::serve(&config.server, Arc::clone(&controller), origin, shutdown).await?;

    log::info!("Shutting down");
    controller.shutdown().await;
    if let Some(stats) = controller.stats() {
        log::info!(
            "Served {} hit(s), {} miss(es), {} fallback(s), hit ratio {:.2}",
            stats.cache_hits,
            stats.cache_misses,
            stats.fallbacks,
            stats.hit_ratio()
        );
    }
    Ok(())
}
