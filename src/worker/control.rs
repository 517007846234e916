use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigHandle, WatchConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Suspended,
}

/// Why a worker's sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    /// Run state or configuration changed.
    Interrupted,
    Terminated,
}

// Run state plus the number of suspended -> running transitions so far.
type Lifecycle = (RunState, u64);

/// The worker's side of its lifecycle: run state, live config and the
/// terminate signal. Owned exclusively by the worker task.
#[derive(Debug)]
pub struct Signals {
    state: watch::Receiver<Lifecycle>,
    config: watch::Receiver<WatchConfig>,
    cancel: CancellationToken,
}

impl Signals {
    /// Current configuration; marks it seen so a later change wakes the worker.
    pub fn config(&mut self) -> WatchConfig {
        self.config.borrow_and_update().clone()
    }

    pub fn run_state(&mut self) -> RunState {
        self.state.borrow_and_update().0
    }

    /// How many times the worker has been resumed after a suspend. Counts
    /// every resume, even one the worker never observed as suspended.
    pub fn resumes(&self) -> u64 {
        self.state.borrow().1
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep for `duration`, returning early on terminate, suspend/resume or
    /// a configuration change.
    pub async fn sleep(&mut self, duration: Duration) -> Wake {
        if self.cancel.is_cancelled() {
            return Wake::Terminated;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Wake::Terminated,
            Ok(()) = self.state.changed() => Wake::Interrupted,
            Ok(()) = self.config.changed() => Wake::Interrupted,
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
        }
    }

    /// Sleep for exactly `duration` unless terminated. Used where the length
    /// of the pause matters more than reacting to a config change.
    pub async fn pause(&self, duration: Duration) -> Wake {
        tokio::select! {
            _ = self.cancel.cancelled() => Wake::Terminated,
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
        }
    }
}

/// Creates the paired [`Signals`] and [`WorkerControl`] for one worker.
pub fn worker_channel(name: &'static str, config: &ConfigHandle) -> (Signals, WorkerControl) {
    let (state_tx, state_rx) = watch::channel((RunState::Running, 0));
    let cancel = CancellationToken::new();
    let signals = Signals {
        state: state_rx,
        config: config.subscribe(),
        cancel: cancel.clone(),
    };
    let control = WorkerControl {
        name,
        state: Arc::new(state_tx),
        cancel,
    };
    (signals, control)
}

/// Lifecycle controls for one worker, used by whatever manages services.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    name: &'static str,
    state: Arc<watch::Sender<Lifecycle>>,
    cancel: CancellationToken,
}

impl WorkerControl {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Start or resume processing.
    pub fn start(&self) {
        tracing::info!(worker = self.name, "Starting worker");
        self.state.send_modify(|(state, resumes)| {
            if *state == RunState::Suspended {
                *resumes += 1;
            }
            *state = RunState::Running;
        });
    }

    /// Stop doing work without ending the task. Safe to repeat.
    pub fn suspend(&self) {
        tracing::info!(worker = self.name, "Suspending worker");
        self.state.send_modify(|(state, _)| *state = RunState::Suspended);
    }

    /// Cooperative terminate; interrupts any sleep in progress.
    pub fn terminate(&self) {
        tracing::info!(worker = self.name, "Terminating worker");
        self.cancel.cancel();
    }

    pub fn run_state(&self) -> RunState {
        self.state.borrow().0
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

enum Join {
    Task(tokio::task::JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

/// A running worker: its controls plus whatever is executing it.
pub struct WorkerHandle {
    control: WorkerControl,
    join: Join,
}

impl WorkerHandle {
    pub fn from_task(control: WorkerControl, task: tokio::task::JoinHandle<()>) -> Self {
        Self {
            control,
            join: Join::Task(task),
        }
    }

    pub fn from_thread(control: WorkerControl, thread: std::thread::JoinHandle<()>) -> Self {
        Self {
            control,
            join: Join::Thread(thread),
        }
    }

    pub fn control(&self) -> &WorkerControl {
        &self.control
    }

    pub fn start(&self) {
        self.control.start();
    }

    pub fn suspend(&self) {
        self.control.suspend();
    }

    pub fn terminate(&self) {
        self.control.terminate();
    }

    pub fn is_finished(&self) -> bool {
        match &self.join {
            Join::Task(task) => task.is_finished(),
            Join::Thread(thread) => thread.is_finished(),
        }
    }

    /// Terminate and wait for the worker to exit.
    pub async fn shutdown(self) {
        self.control.terminate();
        let name = self.control.name;
        match self.join {
            Join::Task(task) => {
                if let Err(e) = task.await {
                    tracing::warn!(worker = name, error = %e, "Worker task ended abnormally");
                }
            }
            Join::Thread(thread) => {
                let joined = tokio::task::spawn_blocking(move || thread.join()).await;
                if !matches!(joined, Ok(Ok(()))) {
                    tracing::warn!(worker = name, "Worker thread ended abnormally");
                }
            }
        }
    }
}
