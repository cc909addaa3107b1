#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::{
    config::{CliArgs, ServerConfig},
    pool::manager::WorkerPool,
    telemetry::init_telemetry,
};
use tokio::signal;
use turnstile::{Connection, ListenerFacade, LocalWorkerChannel, spawn_router};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let facade = ListenerFacade::new(config.bind_target()?, config.bind_options());
    let (router, router_task) = spawn_router::<Connection, LocalWorkerChannel<Connection>, _>(
        facade.clone(),
        config.router_mailbox_size,
    );

    // Workers register before the listener starts, so readiness releases all
    // of them together.
    let mut pool = WorkerPool::spawn(&config, &router).await?;
    let accept_task = facade.start(router.clone());

    let res = match pool.wait_ready().await {
        Ok(addr) => {
            let addr = addr.map_or_else(|| facade.target().to_string(), |addr| addr.to_string());
            log_startup_info(&addr, &config);
            shutdown_signal().await;
            Ok(())
        }
        Err(err) => Err(anyhow::Error::from(err).context("listener failed to start")),
    };

    pool.shutdown().await;
    drop(pool);
    drop(router);

    if let Err(_e) = accept_task.await {
        #[cfg(feature = "tracing")]
        tracing::error!("Accept loop panicked: {_e}");
    }

    match router_task.await {
        Ok(_stats) => {
            #[cfg(feature = "tracing")]
            tracing::info!("Router stopped: {_stats:?}");
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Router task failed: {_e}");
        }
    }

    providers.shutdown();
    res
}

fn log_startup_info(_addr: &str, _config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Serving on {} with full config: {:#?}",
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Serving on {} with {} workers",
            _addr,
            _config.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");
}
