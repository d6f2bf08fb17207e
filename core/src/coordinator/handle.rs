// Event loop and the cloneable handle used to feed it.
//
// Commands, maintenance ticks and deferred announcement pairings are
// multiplexed onto one task, so coordinator state is only ever touched from
// there.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::Coordinator;
use crate::command::{Command, Reply};
use crate::CoordinatorError;

type ReplySender = mpsc::Sender<Result<Option<Reply>, CoordinatorError>>;

/// Requests accepted by the event loop
#[derive(Debug)]
enum Request {
    Command {
        command: Command,
        reply: Option<ReplySender>,
    },
    /// A JSON command envelope, parsed inside the loop so parse failures are
    /// reported like any other rejection
    Raw {
        text: String,
        reply: Option<ReplySender>,
    },
    Shutdown {
        reply: mpsc::Sender<()>,
    },
}

/// Handle for talking to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    command_tx: mpsc::Sender<Request>,
}

impl CoordinatorHandle {
    /// Queue a command without waiting for its outcome.
    pub async fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.command_tx
            .send(Request::Command {
                command,
                reply: None,
            })
            .await
            .map_err(|_| CoordinatorError::Stopped)
    }

    /// Run a command and wait for its reply.
    pub async fn request(&self, command: Command) -> Result<Option<Reply>, CoordinatorError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Request::Command {
                command,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        reply_rx.recv().await.ok_or(CoordinatorError::Stopped)?
    }

    /// Run a JSON command envelope and wait for its reply.
    pub async fn request_json(&self, text: &str) -> Result<Option<Reply>, CoordinatorError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Request::Raw {
                text: text.to_string(),
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        reply_rx.recv().await.ok_or(CoordinatorError::Stopped)?
    }

    /// Stop the loop after flushing the store.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Request::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        reply_rx.recv().await.ok_or(CoordinatorError::Stopped)
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

impl Coordinator {
    /// Move the coordinator onto its own task. The task hands the
    /// coordinator back when the loop ends.
    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<Coordinator>) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let task = tokio::spawn(self.run(command_rx));
        (CoordinatorHandle { command_tx }, task)
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<Request>) -> Self {
        let period = self.config.maintenance.interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Coordinator started, maintenance every {:?}", period);
        self.run_maintenance_cycle().await;

        loop {
            let deferred = self.next_deferred_delay();
            tokio::select! {
                request = command_rx.recv() => {
                    let Some(request) = request else {
                        debug!("All handles dropped");
                        break;
                    };
                    match request {
                        Request::Command { command, reply } => {
                            let result = self.dispatch(command).await;
                            answer(reply, result).await;
                        }
                        Request::Raw { text, reply } => {
                            let result = self.dispatch_json(&text).await;
                            answer(reply, result).await;
                        }
                        Request::Shutdown { reply } => {
                            self.flush_store().await;
                            let _ = reply.send(()).await;
                            info!("Coordinator stopped");
                            return self;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.run_maintenance_cycle().await;
                }
                _ = time::sleep(deferred.unwrap_or_default()), if deferred.is_some() => {
                    self.run_deferred().await;
                }
            }
        }

        self.flush_store().await;
        info!("Coordinator stopped");
        self
    }

    async fn flush_store(&mut self) {
        if let Err(e) = self.store.flush().await {
            error!("Failed to flush store on shutdown: {}", e);
        }
    }
}

async fn answer(reply: Option<ReplySender>, result: Result<Option<Reply>, CoordinatorError>) {
    if let Some(reply) = reply {
        if reply.send(result).await.is_err() {
            warn!("Requester went away before its reply");
        }
    }
}
