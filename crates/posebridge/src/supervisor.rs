//! Worker supervisor - owns the lifecycle of the localization process.
//!
//! State machine over the single worker slot:
//!
//! ```text
//! absent  --load-->      running   (spawn + start relay)
//! running --load-->      running   (no-op, logged)
//! running --shutdown-->  absent    (SIGINT, wait for exit)
//! absent  --shutdown-->  absent    (no-op, logged)
//! running --exit-->      absent    (noticed on the next command)
//! ```
//!
//! Load, shutdown and termination all hold the slot lock for their whole
//! transition, so at most one worker exists and a termination that arrives
//! mid-shutdown waits for it and then finds nothing left to stop.

use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::command::ControlCommand;
use crate::relay::{OutputRelay, RelayStats};
use crate::spawner::{SpawnError, SpawnedWorker, WorkerSpawner};

/// How long to wait for the relay to drain after the worker exited. A
/// grandchild holding the pipe open would otherwise keep it alive forever.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Absent,
    Running { pid: Option<u32> },
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Running { .. } => "running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Started { pid: Option<u32> },
    AlreadyRunning { pid: Option<u32> },
    /// Termination has begun; no new worker may start.
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Stopped { status: ExitStatus },
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Stopped { status: ExitStatus },
    NoWorker,
    AlreadyTerminated,
}

struct RunningWorker {
    child: Child,
    pid: Option<u32>,
    relay: JoinHandle<RelayStats>,
    started_at: Instant,
}

#[derive(Default)]
struct Slot {
    worker: Option<RunningWorker>,
    terminated: bool,
}

/// Sole owner of the worker process.
pub struct WorkerSupervisor {
    spawner: Arc<dyn WorkerSpawner>,
    relay: OutputRelay,
    slot: Mutex<Slot>,
    relays_started: AtomicUsize,
}

impl WorkerSupervisor {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, relay: OutputRelay) -> Self {
        Self {
            spawner,
            relay,
            slot: Mutex::new(Slot::default()),
            relays_started: AtomicUsize::new(0),
        }
    }

    /// Number of relay tasks started over the supervisor's lifetime.
    pub fn relays_started(&self) -> usize {
        self.relays_started.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> WorkerState {
        let mut slot = self.slot.lock().await;
        reap_if_exited(&mut slot).await;
        match &slot.worker {
            Some(worker) => WorkerState::Running { pid: worker.pid },
            None => WorkerState::Absent,
        }
    }

    /// Decode and dispatch one command payload.
    ///
    /// Never fails: malformed payloads, unknown actions and lifecycle errors
    /// are logged and dropped.
    pub async fn handle_command(&self, payload: &[u8]) {
        let command = match ControlCommand::from_payload(payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Received invalid command"
                );
                return;
            }
        };

        tracing::info!(action = command.action(), "Received command");

        match command {
            ControlCommand::LoadMap => {
                if let Err(e) = self.handle_load().await {
                    tracing::error!(error = %e, "Failed to start worker");
                }
            }
            ControlCommand::Shutdown => {
                if let Err(e) = self.handle_shutdown().await {
                    tracing::error!(error = %e, "Failed to stop worker");
                }
            }
            ControlCommand::Unknown(action) => {
                tracing::warn!(%action, "Ignoring unrecognized action");
            }
        }
    }

    /// Start the worker unless one is already running.
    pub async fn handle_load(&self) -> Result<LoadOutcome, SupervisorError> {
        let mut slot = self.slot.lock().await;

        if slot.terminated {
            tracing::warn!("Shutting down, not starting worker");
            return Ok(LoadOutcome::Refused);
        }

        reap_if_exited(&mut slot).await;
        if let Some(worker) = &slot.worker {
            tracing::info!(pid = ?worker.pid, "Worker already running");
            return Ok(LoadOutcome::AlreadyRunning { pid: worker.pid });
        }

        tracing::info!("Starting worker");
        let SpawnedWorker { child, output } = self.spawner.spawn()?;
        let pid = child.id();

        let relay = tokio::spawn(self.relay.clone().run(output));
        self.relays_started.fetch_add(1, Ordering::SeqCst);

        slot.worker = Some(RunningWorker {
            child,
            pid,
            relay,
            started_at: Instant::now(),
        });
        tracing::info!(pid = ?pid, "Worker started");

        Ok(LoadOutcome::Started { pid })
    }

    /// Interrupt the worker and wait for it to exit.
    pub async fn handle_shutdown(&self) -> Result<ShutdownOutcome, SupervisorError> {
        let mut slot = self.slot.lock().await;

        reap_if_exited(&mut slot).await;
        let Some(worker) = slot.worker.take() else {
            tracing::info!("No worker to shut down");
            return Ok(ShutdownOutcome::NotRunning);
        };

        tracing::info!(pid = ?worker.pid, "Shutting down worker");
        let status = stop_worker(worker).await?;
        Ok(ShutdownOutcome::Stopped { status })
    }

    /// Final cleanup on process termination. Stops the worker if one is
    /// running and refuses any later load. Safe to call more than once.
    pub async fn terminate(&self) -> Result<TerminateOutcome, SupervisorError> {
        let mut slot = self.slot.lock().await;

        if slot.terminated {
            tracing::debug!("Supervisor already terminated");
            return Ok(TerminateOutcome::AlreadyTerminated);
        }
        slot.terminated = true;

        reap_if_exited(&mut slot).await;
        match slot.worker.take() {
            Some(worker) => {
                tracing::info!(pid = ?worker.pid, "Sending SIGINT to worker");
                let status = stop_worker(worker).await?;
                Ok(TerminateOutcome::Stopped { status })
            }
            None => Ok(TerminateOutcome::NoWorker),
        }
    }
}

/// Clear the slot if the worker exited on its own.
async fn reap_if_exited(slot: &mut Slot) {
    let Some(worker) = slot.worker.as_mut() else {
        return;
    };

    match worker.child.try_wait() {
        Ok(Some(status)) => {
            tracing::warn!(
                pid = ?worker.pid,
                %status,
                uptime_secs = worker.started_at.elapsed().as_secs_f64(),
                "Worker exited on its own"
            );
            if let Some(worker) = slot.worker.take() {
                drain_relay(worker.relay).await;
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(pid = ?worker.pid, error = %e, "Failed to poll worker status");
        }
    }
}

async fn stop_worker(mut worker: RunningWorker) -> Result<ExitStatus, SupervisorError> {
    interrupt(&mut worker);

    let status = worker.child.wait().await.map_err(SupervisorError::Wait)?;
    tracing::info!(
        pid = ?worker.pid,
        %status,
        uptime_secs = worker.started_at.elapsed().as_secs_f64(),
        "Worker exited"
    );

    drain_relay(worker.relay).await;
    Ok(status)
}

/// SIGINT is the worker's graceful-shutdown request. If it cannot be
/// delivered the worker is killed instead so the following wait returns.
fn interrupt(worker: &mut RunningWorker) {
    let Some(pid) = worker.pid.and_then(|pid| i32::try_from(pid).ok()) else {
        tracing::debug!("Worker already reaped, nothing to signal");
        return;
    };

    match kill(Pid::from_raw(pid), Signal::SIGINT) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => {
            tracing::debug!(pid, "Worker gone before SIGINT");
        }
        Err(e) => {
            tracing::error!(pid, error = %e, "Failed to send SIGINT, killing worker");
            if let Err(e) = worker.child.start_kill() {
                tracing::error!(pid, error = %e, "Failed to kill worker");
            }
        }
    }
}

async fn drain_relay(mut relay: JoinHandle<RelayStats>) {
    match tokio::time::timeout(RELAY_DRAIN_TIMEOUT, &mut relay).await {
        Ok(Ok(stats)) => {
            tracing::debug!(
                lines = stats.lines,
                poses = stats.poses_published,
                "Relay finished"
            );
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Relay task failed");
        }
        Err(_) => {
            tracing::warn!("Worker output still open after exit, stopping relay");
            relay.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PosePublisher;
    use crate::bus::testing::RecordingBus;
    use crate::pose::PoseTransform;
    use crate::spawner::CommandSpawner;
    use crate::spawner::testing::{
        POSE_WORKER, SHORT_LIVED_WORKER, SLOW_EXIT_WORKER, ScriptSpawner,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn supervisor(
        spawner: &Arc<ScriptSpawner>,
        bus: &Arc<RecordingBus>,
    ) -> Arc<WorkerSupervisor> {
        let relay = OutputRelay::new(
            Arc::clone(bus) as Arc<dyn PosePublisher>,
            "/pose/jetson_01",
            PoseTransform::default(),
        );
        Arc::new(WorkerSupervisor::new(
            Arc::clone(spawner) as Arc<dyn WorkerSpawner>,
            relay,
        ))
    }

    async fn wait_until_absent(supervisor: &WorkerSupervisor) {
        tokio::time::timeout(WAIT, async {
            while supervisor.state().await.is_running() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("worker did not exit");
    }

    #[tokio::test]
    async fn load_starts_exactly_one_worker() {
        let spawner = Arc::new(ScriptSpawner::new(POSE_WORKER));
        let bus = Arc::new(RecordingBus::new());
        let supervisor = supervisor(&spawner, &bus);

        assert_eq!(supervisor.state().await, WorkerState::Absent);
        let outcome = supervisor.handle_load().await.unwrap();
        assert!(matches!(outcome, LoadOutcome::Started { pid: Some(_) }));
        assert!(supervisor.state().await.is_running());

        assert!(bus.wait_for(1, WAIT).await);
        assert_eq!(bus.payloads(), vec![serde_json::json!({"x": 20, "y": 4})]);

        let again = supervisor.handle_load().await.unwrap();
        assert!(matches!(again, LoadOutcome::AlreadyRunning { .. }));
        assert_eq!(spawner.spawns(), 1);
        assert_eq!(supervisor.relays_started(), 1);

        supervisor.handle_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_and_waits() {
        let spawner = Arc::new(ScriptSpawner::new(POSE_WORKER));
        let bus = Arc::new(RecordingBus::new());
        let supervisor = supervisor(&spawner, &bus);

        supervisor.handle_load().await.unwrap();
        assert!(bus.wait_for(1, WAIT).await);

        let outcome = supervisor.handle_shutdown().await.unwrap();
        assert!(
            matches!(outcome, ShutdownOutcome::Stopped { status } if status.success()),
            "{outcome:?}"
        );
        assert_eq!(supervisor.state().await, WorkerState::Absent);

        let again = supervisor.handle_shutdown().await.unwrap();
        assert_eq!(again, ShutdownOutcome::NotRunning);
    }

    #[tokio::test]
    async fn shutdown_without_worker_is_a_noop() {
        let spawner = Arc::new(ScriptSpawner::new(POSE_WORKER));
        let bus = Arc::new(RecordingBus::new());
        let supervisor = supervisor(&spawner, &bus);

        assert_eq!(
            supervisor.handle_shutdown().await.unwrap(),
            ShutdownOutcome::NotRunning
        );
        assert_eq!(spawner.spawns(), 0);
    }

    #[tokio::test]
    async fn worker_that_exits_is_reaped_and_can_be_restarted() {
        let spawner = Arc::new(ScriptSpawner::new(SHORT_LIVED_WORKER));
        let bus = Arc::new(RecordingBus::new());
        let supervisor = supervisor(&spawner, &bus);

        supervisor.handle_load().await.unwrap();
        assert!(bus.wait_for(1, WAIT).await);
        wait_until_absent(&supervisor).await;

        let outcome = supervisor.handle_load().await.unwrap();
        assert!(matches!(outcome, LoadOutcome::Started { .. }));
        assert_eq!(spawner.spawns(), 2);
        assert!(bus.wait_for(2, WAIT).await);
        assert_eq!(
            bus.payloads(),
            vec![
                serde_json::json!({"x": 10, "y": -5}),
                serde_json::json!({"x": 10, "y": -5}),
            ]
        );
    }

    #[tokio::test]
    async fn terminate_stops_worker_and_refuses_new_ones() {
        let spawner = Arc::new(ScriptSpawner::new(POSE_WORKER));
        let bus = Arc::new(RecordingBus::new());
        let supervisor = supervisor(&spawner, &bus);

        supervisor.handle_load().await.unwrap();
        assert!(bus.wait_for(1, WAIT).await);

        let outcome = supervisor.terminate().await.unwrap();
        assert!(matches!(outcome, TerminateOutcome::Stopped { .. }));
        assert_eq!(supervisor.state().await, WorkerState::Absent);

        assert_eq!(
            supervisor.terminate().await.unwrap(),
            TerminateOutcome::AlreadyTerminated
        );
        assert_eq!(supervisor.handle_load().await.unwrap(), LoadOutcome::Refused);
        assert_eq!(spawner.spawns(), 1);
    }

    #[tokio::test]
    async fn terminate_without_worker() {
        let spawner = Arc::new(ScriptSpawner::new(POSE_WORKER));
        let bus = Arc::new(RecordingBus::new());
        let supervisor = supervisor(&spawner, &bus);

        assert_eq!(
            supervisor.terminate().await.unwrap(),
            TerminateOutcome::NoWorker
        );
    }

    #[tokio::test]
    async fn termination_during_shutdown_waits_for_it() {
        let spawner = Arc::new(ScriptSpawner::new(SLOW_EXIT_WORKER));
        let bus = Arc::new(RecordingBus::new());
        let supervisor = supervisor(&spawner, &bus);

        supervisor.handle_load().await.unwrap();
        assert!(bus.wait_for(1, WAIT).await);

        let shutdown = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.handle_shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let terminate = supervisor.terminate().await.unwrap();
        let shutdown = shutdown.await.unwrap().unwrap();

        assert!(matches!(shutdown, ShutdownOutcome::Stopped { .. }));
        assert_eq!(terminate, TerminateOutcome::NoWorker);
        assert_eq!(supervisor.state().await, WorkerState::Absent);
    }

    #[tokio::test]
    async fn commands_drive_the_state_machine() {
        let spawner = Arc::new(ScriptSpawner::new(POSE_WORKER));
        let bus = Arc::new(RecordingBus::new());
        let supervisor = supervisor(&spawner, &bus);

        supervisor.handle_command(b"not json").await;
        supervisor.handle_command(br#"{"action":"reboot"}"#).await;
        assert_eq!(supervisor.state().await, WorkerState::Absent);
        assert_eq!(spawner.spawns(), 0);

        supervisor.handle_command(br#"{"action":"load_map"}"#).await;
        supervisor.handle_command(br#"{"action":"load_map"}"#).await;
        assert!(supervisor.state().await.is_running());
        assert_eq!(spawner.spawns(), 1);

        supervisor.handle_command(br#"{"action":"shutdown"}"#).await;
        assert_eq!(supervisor.state().await, WorkerState::Absent);
        supervisor.handle_command(br#"{"action":"shutdown"}"#).await;
        assert_eq!(supervisor.state().await, WorkerState::Absent);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_slot_empty() {
        let bus = Arc::new(RecordingBus::new());
        let relay = OutputRelay::new(
            Arc::clone(&bus) as Arc<dyn PosePublisher>,
            "/pose/jetson_01",
            PoseTransform::default(),
        );
        let spawner = CommandSpawner::new("/nonexistent/posebridge-worker", ["loc"]);
        let supervisor = WorkerSupervisor::new(Arc::new(spawner), relay);

        assert!(matches!(
            supervisor.handle_load().await,
            Err(SupervisorError::Spawn(_))
        ));
        supervisor.handle_command(br#"{"action":"load_map"}"#).await;
        assert_eq!(supervisor.state().await, WorkerState::Absent);
        assert_eq!(supervisor.relays_started(), 0);
    }

    #[test]
    fn state_names() {
        assert_eq!(WorkerState::Absent.as_str(), "absent");
        assert_eq!(WorkerState::Running { pid: None }.as_str(), "running");
    }
}
