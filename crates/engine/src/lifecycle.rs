use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use common::{Bar, EngineCommand, EngineState, Fill};

use crate::pipeline::Pipeline;

/// Cloneable handle for whoever controls the engine.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    state: Arc<RwLock<EngineState>>,
}

impl EngineHandle {
    pub async fn send(&self, cmd: EngineCommand) {
        let _ = self.command_tx.send(cmd).await;
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Shared state read by pipelines before every entry.
    pub fn state_handle(&self) -> Arc<RwLock<EngineState>> {
        self.state.clone()
    }
}

/// A pipeline with the streams it will consume once started.
struct PipelineRun {
    pipeline: Pipeline,
    bars: mpsc::Receiver<Bar>,
    fills: mpsc::UnboundedReceiver<Fill>,
}

/// Owns the pipeline tasks and processes lifecycle commands.
///
/// `Start` spawns the pipelines and admits entries. `Stop` and `Pause` both
/// suppress new entries while pipelines keep managing open positions; `Stop`
/// is undone by `Start`, `Pause` by `Resume`.
pub struct Engine {
    state: Arc<RwLock<EngineState>>,
    command_rx: mpsc::Receiver<EngineCommand>,
    pending: Vec<PipelineRun>,
    tasks: JoinSet<()>,
}

impl Engine {
    pub fn new() -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let state = Arc::new(RwLock::new(EngineState::Stopped));

        let handle = EngineHandle {
            command_tx,
            state: state.clone(),
        };
        let engine = Engine {
            state,
            command_rx,
            pending: Vec::new(),
            tasks: JoinSet::new(),
        };
        (engine, handle)
    }

    pub fn add_pipeline(
        &mut self,
        pipeline: Pipeline,
        bars: mpsc::Receiver<Bar>,
        fills: mpsc::UnboundedReceiver<Fill>,
    ) {
        self.pending.push(PipelineRun {
            pipeline,
            bars,
            fills,
        });
    }

    /// Run until every pipeline has finished or the command channel closes.
    /// Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!(
            pipelines = self.pending.len(),
            "Engine initialized in Stopped state. Waiting for Start command."
        );
        let mut started = false;

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(EngineCommand::Start) => {
                        let current = *self.state.read().await;
                        if current == EngineState::Running {
                            info!("Engine already running");
                            continue;
                        }
                        *self.state.write().await = EngineState::Running;
                        if !started {
                            started = true;
                            info!(pipelines = self.pending.len(), "Starting pipelines");
                            for run in self.pending.drain(..) {
                                self.tasks.spawn(run.pipeline.run(run.bars, run.fills));
                            }
                            if self.tasks.is_empty() {
                                warn!("No pipelines configured");
                                break;
                            }
                        } else {
                            info!("Engine restarted, entries admitted");
                        }
                    }
                    Some(EngineCommand::Stop) => {
                        info!("Engine stopped, entries suppressed; open positions stay managed");
                        *self.state.write().await = EngineState::Stopped;
                    }
                    Some(EngineCommand::Pause) => {
                        let current = *self.state.read().await;
                        if current == EngineState::Running {
                            info!("Engine paused, entries suppressed");
                            *self.state.write().await = EngineState::Paused;
                        }
                    }
                    Some(EngineCommand::Resume) => {
                        let current = *self.state.read().await;
                        if current == EngineState::Paused {
                            info!("Engine resumed");
                            *self.state.write().await = EngineState::Running;
                        } else {
                            warn!(state = %current, "Resume received but engine is not paused");
                        }
                    }
                    None => {
                        warn!("Engine command channel closed, shutting down");
                        self.tasks.abort_all();
                        break;
                    }
                },
                Some(joined) = self.tasks.join_next(), if started => {
                    if let Err(e) = joined {
                        error!(error = %e, "Pipeline task failed");
                    }
                    if self.tasks.is_empty() {
                        info!("All pipelines finished");
                        break;
                    }
                }
            }
        }
        *self.state.write().await = EngineState::Stopped;
    }
}
