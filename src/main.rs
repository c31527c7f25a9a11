//! netforged: the traffic-core daemon.
//!
//! Brings up the core over the host's ports, restores the persisted
//! configuration, and runs until SIGINT/SIGTERM, then disables every
//! running profile within its grace period before exiting.

use std::path::PathBuf;

use netforge::{Core, CoreOptions};

fn parse_args() -> CoreOptions {
    let mut options = CoreOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                options.config_path = args.next().map(PathBuf::from);
            }
            "--help" | "-h" => {
                eprintln!("usage: netforged [--config <profiles.json>]");
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }
    options
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Panics must reach the log before the default hook unwinds.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in netforge: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netforge=info".into()),
        )
        .init();

    let options = parse_args();

    #[cfg(target_os = "linux")]
    let provider = netforge::afpacket_provider();
    #[cfg(not(target_os = "linux"))]
    anyhow::bail!("netforged requires Linux AF_PACKET support");

    #[cfg(target_os = "linux")]
    {
        let core = Core::start(options, provider).await?;
        tracing::info!("netforged running; send SIGINT or SIGTERM to stop");

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }

        core.shutdown().await;
        Ok(())
    }
}
