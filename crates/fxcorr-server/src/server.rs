// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! The control server: TCP accept loop, per-connection request loop,
//! and the shared server state behind the verbs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fxcorr::config::InstrumentConfig;
use fxcorr::error::Error;
use fxcorr::instrument::Instrument;
use fxcorr::transport::sim::SimFactory;
use fxcorr::transport::TransportFactory;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::protocol::{parse_request, Reply};
use crate::verbs;

/// Shared server state: the instrument (once created), the transport
/// factory, the verb-serialisation lock and the metadata cadence.
pub struct ServerState {
    default_config: Option<PathBuf>,
    factory_override: Option<Arc<dyn TransportFactory>>,
    instrument: Mutex<Option<Arc<Instrument>>>,
    created: AtomicBool,
    dispatch_lock: tokio::sync::Mutex<()>,
    meta_cadence_secs: AtomicU64,
    meta_task_started: AtomicBool,
    shutdown: Notify,
}

impl ServerState {
    pub fn new(
        default_config: Option<PathBuf>,
        factory_override: Option<Arc<dyn TransportFactory>>,
    ) -> Arc<Self> {
        Arc::new(ServerState {
            default_config,
            factory_override,
            instrument: Mutex::new(None),
            created: AtomicBool::new(false),
            dispatch_lock: tokio::sync::Mutex::new(()),
            meta_cadence_secs: AtomicU64::new(5),
            meta_task_started: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    pub fn instrument(&self) -> Option<Arc<Instrument>> {
        self.instrument.lock().clone()
    }

    pub(crate) fn set_instrument(&self, instrument: Arc<Instrument>, meta_cadence_secs: u64) {
        *self.instrument.lock() = Some(instrument);
        self.meta_cadence_secs
            .store(meta_cadence_secs, Ordering::Release);
        self.created.store(true, Ordering::Release);
    }

    pub(crate) fn dispatch_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.dispatch_lock
    }

    pub fn meta_cadence(&self) -> u64 {
        self.meta_cadence_secs.load(Ordering::Acquire)
    }

    pub fn set_meta_cadence(&self, secs: u64) {
        self.meta_cadence_secs.store(secs, Ordering::Release);
        if secs == 0 {
            info!("periodic metadata disabled");
        } else {
            info!(secs, "periodic metadata cadence set");
        }
    }

    /// Resolve the config document: the verb argument, then the
    /// `--config` flag, then the environment variable.
    pub(crate) fn load_config(&self, arg: Option<&str>) -> Result<InstrumentConfig, Reply> {
        let from_path = |p: &std::path::Path| {
            InstrumentConfig::from_file(p).map_err(|e| Reply::from(Error::from(e)))
        };
        match arg {
            Some(path) if !path.is_empty() => from_path(std::path::Path::new(path)),
            _ => match &self.default_config {
                Some(path) => from_path(path),
                None => InstrumentConfig::from_env().map_err(|e| Reply::from(Error::from(e))),
            },
        }
    }

    /// Pick the transport factory for a configuration.
    pub(crate) fn factory_for(
        &self,
        config: &InstrumentConfig,
    ) -> Result<Arc<dyn TransportFactory>, Reply> {
        if let Some(factory) = &self.factory_override {
            return Ok(factory.clone());
        }
        match config.hosts.transport.as_str() {
            "sim" => Ok(SimFactory::new()),
            other => Err(Reply::from(Error::config(
                "hosts.transport",
                format!("transport '{other}' is not built in; supply one via the library API"),
            ))),
        }
    }

    /// Start the periodic metadata transmitter once. A cadence of zero
    /// pauses it; re-raising the cadence resumes.
    pub(crate) fn start_metadata_task(self: &Arc<Self>) {
        if self.meta_task_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = self.clone();
        tokio::spawn(async move {
            loop {
                let cadence = state.meta_cadence();
                let sleep_for = Duration::from_secs(if cadence == 0 { 1 } else { cadence });
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = state.shutdown.notified() => break,
                }
                if cadence == 0 {
                    continue;
                }
                if let Some(instr) = state.instrument() {
                    if let Err(e) = instr.issue_metadata(None).await {
                        warn!(error = %e, "periodic metadata send failed");
                    }
                }
            }
            debug!("metadata task stopped");
        });
    }

    /// Stop the accept loop and background tasks.
    pub fn shutdown(&self) {
        if let Some(instr) = self.instrument() {
            instr.stop_sensors();
            instr.xops.stop_vacc_monitor();
        }
        self.shutdown.notify_waiters();
    }
}

/// The listening control server.
pub struct ControlServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl ControlServer {
    pub async fn bind(addr: &str, state: Arc<ServerState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "control server listening");
        Ok(ControlServer { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Accept connections until shutdown.
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "new control connection");
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, state).await;
                                debug!(%peer, "control connection closed");
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = self.state.shutdown.notified() => {
                    info!("control server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Requests on one connection are processed in the order received, one
/// at a time.
async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        };
        let Some(request) = parse_request(&line) else {
            continue;
        };

        let mut informs = Vec::new();
        let reply: Reply =
            verbs::dispatch(&state, &request.verb, &request.args, &mut informs).await;

        let mut out = String::new();
        for inform in informs {
            out.push_str(&inform);
            out.push('\n');
        }
        out.push_str(&reply.render(&request.verb));
        out.push('\n');
        if write_half.write_all(out.as_bytes()).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
}
