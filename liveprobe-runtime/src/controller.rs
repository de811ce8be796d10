// Engine control loop
//
// One dedicated thread owns the probe manager and everything it guards.
// Control commands arrive over an mpsc channel carrying a oneshot reply
// each; pause events and the flush timer are multiplexed into the same
// select loop, so every mutation of shared state happens from exactly one
// place and an enable/disable transition always finishes before the next
// operation starts.

use std::time::Instant;

use liveprobe::config::{EngineSettings, ProbeConfig};
use liveprobe::error::{ProbeError, ProbeResult};
use liveprobe::manager::{BatchKind, ProbeManager};
use liveprobe::session::{DebugSession, PauseEvent};
use liveprobe::transport::{Transport, TransportBackend};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

enum Command {
    Apply(Box<ProbeConfig>),
    Modify(Box<ProbeConfig>),
    Remove(String),
}

struct ControlRequest {
    command: Command,
    reply_tx: oneshot::Sender<ProbeResult<()>>,
}

/// Handle for talking to a running engine. Cheap to clone; usable from any
/// runtime.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<ControlRequest>,
}

impl EngineHandle {
    pub async fn apply_probe(&self, config: ProbeConfig) -> ProbeResult<()> {
        self.send(Command::Apply(Box::new(config))).await
    }

    pub async fn modify_probe(&self, config: ProbeConfig) -> ProbeResult<()> {
        self.send(Command::Modify(Box::new(config))).await
    }

    pub async fn remove_probe(&self, probe_id: &str) -> ProbeResult<()> {
        self.send(Command::Remove(probe_id.to_string())).await
    }

    async fn send(&self, command: Command) -> ProbeResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ControlRequest { command, reply_tx })
            .await
            .map_err(|_| ProbeError::EngineStopped)?;
        reply_rx.await.map_err(|_| ProbeError::EngineStopped)?
    }
}

/// Start the engine on a dedicated thread. Dropping every handle shuts the
/// engine down after a final flush.
pub fn spawn_engine<S, B>(
    session: S,
    backend: B,
    prefer_legacy_input: bool,
    settings: EngineSettings,
    pause_rx: mpsc::Receiver<PauseEvent>,
) -> EngineHandle
where
    S: DebugSession + Send + 'static,
    B: TransportBackend + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(64);

    let spawned = std::thread::Builder::new().name("liveprobe-engine".to_string()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!("failed to build engine runtime: {err}");
                return;
            }
        };
        runtime.block_on(engine_loop(
            session,
            backend,
            prefer_legacy_input,
            settings,
            command_rx,
            pause_rx,
        ));
    });
    if let Err(err) = spawned {
        // The receivers died with the closure; callers see EngineStopped.
        error!("failed to spawn engine thread: {err}");
    }

    EngineHandle { command_tx }
}

async fn engine_loop<S: DebugSession, B: TransportBackend>(
    session: S,
    backend: B,
    prefer_legacy_input: bool,
    settings: EngineSettings,
    mut command_rx: mpsc::Receiver<ControlRequest>,
    mut pause_rx: mpsc::Receiver<PauseEvent>,
) {
    info!("probe engine started");

    let flush_interval = settings.batch_flush_interval;
    let mut manager = ProbeManager::new(session, settings);
    let mut transport = Transport::new(backend, prefer_legacy_input);
    let mut flush = tokio::time::interval(flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pause_open = true;

    loop {
        tokio::select! {
            request = command_rx.recv() => match request {
                Some(request) => {
                    let result = match request.command {
                        Command::Apply(config) => manager.add_probe(*config).await,
                        Command::Modify(config) => manager.modify_probe(*config).await,
                        Command::Remove(probe_id) => manager.remove_probe(&probe_id).await,
                    };
                    request.reply_tx.send(result).ok();
                    dispatch(&mut manager, &mut transport, false).await;
                }
                None => break,
            },
            event = pause_rx.recv(), if pause_open => match event {
                Some(event) => {
                    manager.on_pause(&event);
                    dispatch(&mut manager, &mut transport, false).await;
                }
                None => {
                    debug!("pause event channel closed");
                    pause_open = false;
                }
            },
            _ = flush.tick() => {
                dispatch(&mut manager, &mut transport, false).await;
            }
        }
    }

    // Final drain so already-acked work is not lost on shutdown.
    dispatch(&mut manager, &mut transport, true).await;
    info!("probe engine stopped");
}

async fn dispatch<S: DebugSession, B: TransportBackend>(
    manager: &mut ProbeManager<S>,
    transport: &mut Transport<B>,
    force: bool,
) {
    for batch in manager.poll_outbound(Instant::now(), force) {
        let result = match batch.kind {
            BatchKind::Diagnostics => transport.send_diagnostics(batch.body).await,
            BatchKind::Input => transport.send_input(batch.body).await,
        };
        if let Err(err) = result {
            warn!(%err, "failed to ship payload batch");
        }
    }
}
