//! Conscience Kernel daemon: boots the store, the kernel and both
//! transports, then runs until SIGINT/SIGTERM.

#![deny(unsafe_code)]

use clap::Parser;
use conscience::grpc::NervousSystemService;
use conscience::{ghost, Kernel};
use kernel_core::config::KernelConfig;
use kernel_core::state::SystemMode;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "conscience-kernel", about = "Local policy gateway for agent actions")]
struct Cli {
    /// Port for the binary RPC plane.
    #[arg(long, default_value_t = 50051)]
    grpc_port: u16,

    /// Reserved for the external web UI; accepted for compatibility.
    #[arg(long, default_value_t = 8080)]
    http_port: u16,

    /// Port for the message-framed plane.
    #[arg(long, default_value_t = 5005)]
    ghost_port: u16,

    /// Directory holding the database, config, token and audit trail.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.data_dir)?;
    let config = KernelConfig::load_or_default(cli.data_dir.join("config.json"))?;
    telemetry::init_json_logging(&config.system.log_level);
    info!(version = kernel_core::VERSION, environment = %config.system.environment, "booting");

    let token = conscience::auth::load_or_generate_token(cli.data_dir.join("kernel.token"))?;
    let store = store::Store::open(cli.data_dir.join("kernel.db"))?;
    let audit = audit_log::AuditLog::with_sink(cli.data_dir.join("audit.jsonl"))?;
    let kernel = Arc::new(Kernel::new(
        store,
        audit,
        config.effective_keywords(),
        token,
    )?);

    // Safe mode boots conservatively: a persisted ACTIVE is downgraded to
    // SHADOW until a client re-arms it.
    if config.security.safe_mode && kernel.mode() == SystemMode::Active {
        warn!("safe_mode set; downgrading persisted ACTIVE to SHADOW");
        kernel.set_mode(SystemMode::Shadow)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let host = config.network.kernel_host.clone();
    let ghost_listener =
        tokio::net::TcpListener::bind((host.as_str(), cli.ghost_port)).await?;
    let ghost_task = tokio::spawn(ghost::serve(
        Arc::clone(&kernel),
        ghost_listener,
        shutdown_rx.clone(),
    ));

    let heartbeat = conscience::events::spawn_heartbeat(Arc::clone(&kernel));

    let grpc_addr: std::net::SocketAddr = format!("{host}:{}", cli.grpc_port).parse()?;
    let service = NervousSystemService::new(Arc::clone(&kernel)).into_server();
    let mut grpc_shutdown = shutdown_rx.clone();
    let grpc_task = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_shutdown(grpc_addr, async {
                let _ = grpc_shutdown.changed().await;
            })
            .await
    });

    info!(
        grpc_port = cli.grpc_port,
        ghost_port = cli.ghost_port,
        http_port = cli.http_port,
        "kernel up (http port reserved for the external UI; not served here)"
    );

    wait_for_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    heartbeat.abort();

    if let Ok(Err(e)) = grpc_task.await {
        warn!(error = %e, "grpc server exited with error");
    }
    let _ = ghost_task.await;
    info!("goodbye");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "sigterm handler unavailable; using ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
