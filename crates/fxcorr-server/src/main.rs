// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! fxcorr-server binary entry point.
//!
//! ```bash
//! # listen on the default port, config named by FXCORR_CONFIG
//! fxcorr-server
//!
//! # explicit config and port
//! fxcorr-server --port 1235 --config instrument.toml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fxcorr_server::{ControlServer, ServerState};

/// FX correlator control server
#[derive(Parser, Debug)]
#[command(name = "fxcorr-server")]
#[command(about = "Control server for an FX correlator instrument")]
#[command(version)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "1235")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Instrument configuration file (falls back to FXCORR_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the runtime");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async move {
        let state = ServerState::new(args.config.clone(), None);
        let server = match ControlServer::bind(&format!("{}:{}", args.bind, args.port), state.clone())
            .await
        {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "failed to bind the control server");
                return ExitCode::from(1);
            }
        };

        let shutdown_state = state.clone();
        let interrupted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let interrupted_flag = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                interrupted_flag.store(true, std::sync::atomic::Ordering::Release);
                shutdown_state.shutdown();
            }
        });

        if let Err(e) = server.run().await {
            error!(error = %e, "control server failed");
            return ExitCode::from(1);
        }

        // grace period for in-flight verbs to drain
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        info!("control server stopped");
        if interrupted.load(std::sync::atomic::Ordering::Acquire) {
            ExitCode::from(130)
        } else {
            ExitCode::SUCCESS
        }
    })
}
