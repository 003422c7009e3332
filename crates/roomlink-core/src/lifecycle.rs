//! Host lifecycle mirroring.
//!
//! The embedding application reports its foreground/background transitions
//! here. The mirrored state decides whether the session's background task
//! group may keep running: once the host reaches `Destroyed`, the event loop
//! exits and no new join is accepted.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Resumed,
    Destroyed,
}

/// Capability through which the host reports its lifecycle.
pub trait LifecycleReporter {
    fn report_lifecycle_state(&self, state: LifecycleState);
}

pub type MainTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs closures on the host's UI/main execution context.
///
/// Lifecycle transitions go through this so they never race host-driven
/// rendering. Implementations may run the task inline when already on the
/// main thread, or post it to the host's main loop.
pub trait MainThread: Send + Sync {
    fn run_on_main(&self, task: MainTask);
}

/// Runs tasks inline. For hosts that already call in from their main thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallingThread;

impl MainThread for CallingThread {
    fn run_on_main(&self, task: MainTask) {
        task();
    }
}

/// Mirrored host lifecycle state, observable from background tasks.
#[derive(Clone)]
pub struct HostLifecycle {
    state: Arc<watch::Sender<LifecycleState>>,
}

impl HostLifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Created);
        Self { state: Arc::new(tx) }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Started or resumed: the host is visible.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), LifecycleState::Started | LifecycleState::Resumed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == LifecycleState::Destroyed
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }
}

impl Default for HostLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleReporter for HostLifecycle {
    fn report_lifecycle_state(&self, state: LifecycleState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            if *current == LifecycleState::Destroyed {
                tracing::warn!("ignoring lifecycle transition to {state:?} after Destroyed");
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::debug!("host lifecycle -> {state:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct QueuedMainThread {
        tasks: Mutex<Vec<MainTask>>,
    }

    impl QueuedMainThread {
        fn drain(&self) {
            let tasks: Vec<MainTask> = self.tasks.lock().unwrap().drain(..).collect();
            for task in tasks {
                task();
            }
        }
    }

    impl MainThread for QueuedMainThread {
        fn run_on_main(&self, task: MainTask) {
            self.tasks.lock().unwrap().push(task);
        }
    }

    #[test]
    fn starts_created_and_inactive() {
        let lifecycle = HostLifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Created);
        assert!(!lifecycle.is_active());
    }

    #[test]
    fn pause_and_stop_step_back_down() {
        let lifecycle = HostLifecycle::new();
        lifecycle.report_lifecycle_state(LifecycleState::Started);
        lifecycle.report_lifecycle_state(LifecycleState::Resumed);
        assert!(lifecycle.is_active());

        lifecycle.report_lifecycle_state(LifecycleState::Started);
        assert_eq!(lifecycle.state(), LifecycleState::Started);
        lifecycle.report_lifecycle_state(LifecycleState::Created);
        assert!(!lifecycle.is_active());
    }

    #[test]
    fn destroyed_is_terminal() {
        let lifecycle = HostLifecycle::new();
        lifecycle.report_lifecycle_state(LifecycleState::Destroyed);
        lifecycle.report_lifecycle_state(LifecycleState::Resumed);
        assert!(lifecycle.is_destroyed());
    }

    #[test]
    fn subscribers_observe_transitions() {
        let lifecycle = HostLifecycle::new();
        let rx = lifecycle.subscribe();
        lifecycle.report_lifecycle_state(LifecycleState::Started);
        assert_eq!(*rx.borrow(), LifecycleState::Started);
    }

    #[test]
    fn transitions_apply_only_when_main_thread_runs_them() {
        let lifecycle = HostLifecycle::new();
        let main = QueuedMainThread::default();

        let reporter = lifecycle.clone();
        main.run_on_main(Box::new(move || {
            reporter.report_lifecycle_state(LifecycleState::Resumed)
        }));
        assert_eq!(lifecycle.state(), LifecycleState::Created);

        main.drain();
        assert_eq!(lifecycle.state(), LifecycleState::Resumed);
    }
}
