//! Bridge wiring: bus commands in, supervisor transitions out.
//!
//! Commands are dispatched one at a time in arrival order on a dedicated
//! task. Termination cancels dispatch between commands, stops the worker
//! through the supervisor and disconnects from the bus exactly once.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusClient, BusError, InboundMessage, PosePublisher};
use crate::config::BridgeConfig;
use crate::relay::OutputRelay;
use crate::spawner::WorkerSpawner;
use crate::supervisor::{TerminateOutcome, WorkerSupervisor};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct Bridge {
    bus: Arc<dyn BusClient>,
    supervisor: Arc<WorkerSupervisor>,
    command_topic: String,
    disconnected: AtomicBool,
}

impl Bridge {
    pub fn new<B>(bus: Arc<B>, spawner: Arc<dyn WorkerSpawner>, config: &BridgeConfig) -> Self
    where
        B: BusClient + 'static,
    {
        let relay = OutputRelay::new(
            Arc::clone(&bus) as Arc<dyn PosePublisher>,
            config.pose_topic(),
            config.transform(),
        );
        Self {
            bus,
            supervisor: Arc::new(WorkerSupervisor::new(spawner, relay)),
            command_topic: config.command_topic(),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// Subscribe to the command topic.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.bus.subscribe(&self.command_topic).await?;
        tracing::info!(topic = %self.command_topic, "Listening for commands");
        Ok(())
    }

    pub async fn handle_message(&self, message: InboundMessage) {
        if message.topic != self.command_topic {
            tracing::debug!(topic = %message.topic, "Ignoring message on unexpected topic");
            return;
        }
        self.supervisor.handle_command(&message.payload).await;
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    message = inbound.recv() => match message {
                        Some(message) => bridge.handle_message(message).await,
                        None => break,
                    },
                }
            }
            tracing::debug!("Command dispatcher stopped");
        })
    }

    /// Dispatch commands until `shutdown` resolves, then terminate.
    ///
    /// Returns an error if the inbound stream closed on its own, which means
    /// the bus connection is gone for good. The worker is stopped either way.
    pub async fn run<F>(
        self: Arc<Self>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        shutdown: F,
    ) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        let cancel = CancellationToken::new();
        let mut dispatcher = self.spawn_dispatcher(inbound, cancel.clone());

        let stream_closed = tokio::select! {
            _ = shutdown => false,
            result = &mut dispatcher => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Command dispatcher failed");
                }
                true
            }
        };

        if !stream_closed {
            // Let an in-flight command finish before tearing down.
            cancel.cancel();
            if let Err(e) = dispatcher.await {
                tracing::error!(error = %e, "Command dispatcher failed");
            }
        } else {
            tracing::warn!("Command stream closed, terminating");
        }

        self.terminate().await;

        if stream_closed {
            Err(BusError::Closed.into())
        } else {
            Ok(())
        }
    }

    /// Stop the worker and disconnect from the bus. Idempotent.
    pub async fn terminate(&self) {
        match self.supervisor.terminate().await {
            Ok(TerminateOutcome::Stopped { status }) => {
                tracing::info!(%status, "Worker stopped");
            }
            Ok(TerminateOutcome::NoWorker) => {
                tracing::info!("No worker running");
            }
            Ok(TerminateOutcome::AlreadyTerminated) => {}
            Err(e) => {
                tracing::error!(error = %e, "Failed to stop worker");
            }
        }

        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.bus.disconnect().await {
            tracing::warn!(error = %e, "Failed to disconnect from bus");
        }
    }
}

/// Process termination signals, installed once at startup.
///
/// Keeping the handlers installed for the rest of the process means a second
/// signal during cleanup is absorbed instead of killing the process.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal; returns its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}
