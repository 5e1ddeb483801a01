//! SecureGuard CLI - run a WireGuard interface from a configuration file
//!
//! Brings up a TUN device and a UDP socket, configures the data plane from a
//! standard WireGuard `.conf` file and forwards traffic until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use secureguard::device::UdpTransport;
use secureguard::error::{DataPathError, TunnelError};
use secureguard::tunnel::TunDevice;
use secureguard::{DataplaneConfig, Device, SecureGuardError, WireGuardConfig};

/// SecureGuard - WireGuard data plane
#[derive(Parser, Debug)]
#[command(name = "secureguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to WireGuard configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Crypto workers per direction (default: available parallelism)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), SecureGuardError> {
    tracing::info!("Loading configuration from: {}", args.config.display());
    let config = WireGuardConfig::from_file(&args.config)?;

    let mut dataplane = DataplaneConfig::from_interface(&config.interface);
    if let Some(workers) = args.workers {
        dataplane.crypto_workers = workers.max(1);
    }

    let transport = Arc::new(UdpTransport::bind(
        config.interface.listen_port.unwrap_or(0),
    )?);
    let tun = Arc::new(TunDevice::create(
        &config.interface.address,
        dataplane.mtu as u16,
    )?);
    let mtu = dataplane.mtu;

    let device = Device::new(dataplane, transport, tun.clone());
    device.apply_config(&config).await?;
    device.up().await;
    tracing::info!(
        "Interface {} listening on UDP port {} with {} peer(s)",
        tun.name(),
        device.local_port(),
        config.peers.len()
    );

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => signal.recv().await,
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    let result = tokio::select! {
        result = device.run() => result.map_err(SecureGuardError::from),
        result = forward_from_tun(&device, &tun, mtu) => result.map_err(SecureGuardError::from),
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
            Ok(())
        }
    };

    device.shutdown().await;
    result
}

/// Read host packets and hand them to the device until the TUN device fails
async fn forward_from_tun(device: &Device, tun: &TunDevice, mtu: usize) -> Result<(), TunnelError> {
    let mut buf = vec![0u8; mtu + 64];
    loop {
        let n = tun.read(&mut buf).await?;
        match device.encapsulate(buf[..n].to_vec()).await {
            Ok(()) => {}
            Err(DataPathError::DeviceDown) => return Ok(()),
            Err(e) => tracing::trace!("Dropping outbound packet: {}", e),
        }
    }
}
