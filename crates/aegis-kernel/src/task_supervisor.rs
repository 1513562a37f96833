//! [`TaskSupervisor`] – named task lifecycle manager.
//!
//! Every long-running loop in the gateway (generator, forwarder, translator,
//! fault bursts) is started through the supervisor under a unique name.
//!
//! # Rules
//!
//! - At most one running task exists per name. Starting a name that is
//!   still running logs a warning and hands back the existing [`TaskHandle`].
//!   A task that is only winding down after a cancel does not hold its name:
//!   the new task replaces it, and [`TaskSupervisor::shutdown_all`] still
//!   waits for the old one.
//! - A finished task removes itself from the registry on every exit path
//!   (success, error, cancellation, panic), so the registry never holds dead
//!   entries.
//! - Cancellation is cooperative: each task body receives a
//!   [`CancellationToken`] and must observe it at every suspension point. A
//!   body that ends because it was cancelled should return
//!   [`GatewayError::Cancelled`].
//!
//! # Example
//!
//! ```
//! use aegis_kernel::{TaskOutcome, TaskSupervisor};
//! use aegis_types::GatewayError;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let sup = TaskSupervisor::new();
//! let handle = sup.start("ticker", |token| async move {
//!     token.cancelled().await;
//!     Err(GatewayError::Cancelled)
//! });
//!
//! assert!(sup.cancel("ticker"));
//! assert_eq!(handle.join().await, TaskOutcome::Cancelled);
//! # });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use aegis_types::GatewayError;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    /// Cancellation was requested; the body has not returned yet.
    Cancelling,
    Done,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Running,
            1 => TaskState::Cancelling,
            _ => TaskState::Done,
        }
    }
}

const RUNNING: u8 = 0;
const CANCELLING: u8 = 1;
const DONE: u8 = 2;

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Failed(GatewayError),
}

/// Cloneable handle to one supervised task.
///
/// Two handles compare equal when they refer to the same task.
#[derive(Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    id: u64,
    token: CancellationToken,
    state: Arc<AtomicU8>,
    completion: Shared<BoxFuture<'static, TaskOutcome>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Supervisor-unique task identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Done
    }

    /// Request cooperative cancellation. Returns `false` when the task has
    /// already finished.
    pub fn cancel(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        let _ = self
            .state
            .compare_exchange(RUNNING, CANCELLING, Ordering::AcqRel, Ordering::Acquire);
        self.token.cancel();
        true
    }

    /// Wait for the task to reach a terminal state. Any number of clones may
    /// join the same task.
    pub async fn join(&self) -> TaskOutcome {
        self.completion.clone().await
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for TaskHandle {}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Completion hook
// ────────────────────────────────────────────────────────────────────────────

type Registry = Arc<Mutex<HashMap<String, TaskHandle>>>;

/// Lives inside the spawned task; marks it done and removes its registry
/// entry when dropped.
struct Deregister {
    registry: Registry,
    name: String,
    state: Arc<AtomicU8>,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.state.store(DONE, Ordering::Release);
        let mut tasks = lock(&self.registry);
        // A newer task may already own the name.
        if tasks
            .get(&self.name)
            .is_some_and(|h| Arc::ptr_eq(&h.state, &self.state))
        {
            tasks.remove(&self.name);
        }
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, TaskHandle>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// TaskSupervisor
// ────────────────────────────────────────────────────────────────────────────

/// Registry of named, cancellable tasks.
///
/// Dropping the supervisor cancels every task it still tracks.
pub struct TaskSupervisor {
    tasks: Registry,
    /// Cancelled tasks whose name was taken over before they finished.
    retiring: Mutex<Vec<TaskHandle>>,
    root: CancellationToken,
    next_id: AtomicU64,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            retiring: Mutex::new(Vec::new()),
            root: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawn `body` under `name`, or return the live task already using it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F, Fut>(&self, name: impl Into<String>, body: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        let name = name.into();
        let mut tasks = lock(&self.tasks);

        if let Some(existing) = tasks.get(&name) {
            match existing.state() {
                TaskState::Running => {
                    warn!(task = %name, "task already running - not starting duplicate");
                    return existing.clone();
                }
                TaskState::Cancelling => {
                    info!(task = %name, id = existing.id(), "replacing task that is still cancelling");
                    self.retire(existing.clone());
                }
                TaskState::Done => {}
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        let state = Arc::new(AtomicU8::new(RUNNING));
        let fut = body(token.clone());

        let registry = Arc::clone(&self.tasks);
        let hook_state = Arc::clone(&state);
        let task_name = name.clone();
        let join = tokio::spawn(async move {
            // Built on first poll: a future that spawn drops unpolled must not
            // lock the registry, which is still held here.
            let _hook = Deregister {
                registry,
                name: task_name.clone(),
                state: hook_state,
            };
            let result = fut.await;
            match &result {
                Ok(()) | Err(GatewayError::Cancelled) => {}
                Err(e) => error!(task = %task_name, error = %e, "task failed"),
            }
            result
        });

        let failed_name = name.clone();
        let done = Arc::clone(&state);
        let completion = async move {
            let joined = join.await;
            done.store(DONE, Ordering::Release);
            match joined {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(GatewayError::Cancelled)) => TaskOutcome::Cancelled,
                Ok(Err(e)) => TaskOutcome::Failed(e),
                Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
                Err(e) => TaskOutcome::Failed(GatewayError::TaskFailed {
                    task: failed_name,
                    details: format!("panicked: {e}"),
                }),
            }
        }
        .boxed()
        .shared();

        let handle = TaskHandle {
            name: Arc::from(name.as_str()),
            id,
            token,
            state,
            completion,
        };
        tasks.insert(name.clone(), handle.clone());
        info!(task = %name, id, "started task");
        handle
    }

    /// Request cancellation of the task registered under `name`.
    ///
    /// Returns whether a cancellation was issued.
    pub fn cancel(&self, name: &str) -> bool {
        let handle = lock(&self.tasks).get(name).cloned();
        match handle {
            Some(h) if h.cancel() => {
                info!(task = %name, "cancelled task");
                true
            }
            _ => false,
        }
    }

    /// Handle of the task registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<TaskHandle> {
        lock(&self.tasks).get(name).cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.get(name).is_some_and(|h| !h.is_finished())
    }

    /// Snapshot of name → still alive.
    pub fn health(&self) -> HashMap<String, bool> {
        lock(&self.tasks)
            .iter()
            .map(|(name, h)| (name.clone(), !h.is_finished()))
            .collect()
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }

    /// Cancel every tracked task and wait until all have finished.
    ///
    /// Cancellation outcomes are swallowed.
    ///
    /// # Errors
    ///
    /// Any task that ended with a non-cancellation failure is reported as
    /// [`GatewayError::TaskFailed`] (aggregated into
    /// [`GatewayError::Multiple`] when more than one failed).
    pub async fn shutdown_all(&self) -> Result<(), GatewayError> {
        let mut handles: Vec<TaskHandle> = lock(&self.tasks).values().cloned().collect();
        handles.append(&mut self.lock_retiring());
        for h in &handles {
            h.cancel();
        }

        let mut failures = Vec::new();
        for h in handles {
            if let TaskOutcome::Failed(e) = h.join().await {
                failures.push(match e {
                    e @ GatewayError::TaskFailed { .. } => e,
                    other => GatewayError::TaskFailed {
                        task: h.name().to_string(),
                        details: other.to_string(),
                    },
                });
            }
        }
        info!("all tasks cancelled/shutdown");
        GatewayError::aggregate(failures)
    }
}

impl TaskSupervisor {
    fn retire(&self, handle: TaskHandle) {
        let mut retiring = self.lock_retiring();
        retiring.retain(|h| !h.is_finished());
        retiring.push(handle);
    }

    fn lock_retiring(&self) -> MutexGuard<'_, Vec<TaskHandle>> {
        self.retiring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn until_cancelled(token: CancellationToken) -> Result<(), GatewayError> {
        token.cancelled().await;
        Err(GatewayError::Cancelled)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn duplicate_start_returns_existing_handle() {
        let sup = TaskSupervisor::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let spawn = |runs: Arc<AtomicUsize>| {
            move |token: CancellationToken| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                until_cancelled(token).await
            }
        };

        let first = sup.start("x", spawn(Arc::clone(&runs)));
        let second = sup.start("x", spawn(Arc::clone(&runs)));

        assert_eq!(first, second);
        assert_eq!(first.id(), second.id());
        assert_eq!(sup.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1, "only one body may run under a name");

        assert!(sup.shutdown_all().await.is_ok());
    }

    #[tokio::test]
    async fn finished_task_deregisters_itself() {
        let sup = TaskSupervisor::new();
        let handle = sup.start("once", |_| async { Ok::<(), GatewayError>(()) });

        assert_eq!(handle.join().await, TaskOutcome::Completed);
        assert!(handle.is_finished());
        assert!(sup.is_empty());
        assert!(sup.health().is_empty());

        // The name is free again.
        let again = sup.start("once", until_cancelled);
        assert_ne!(again, handle);
        assert!(sup.is_running("once"));
        assert!(sup.shutdown_all().await.is_ok());
    }

    #[tokio::test]
    async fn cancel_reports_whether_it_acted() {
        let sup = TaskSupervisor::new();
        assert!(!sup.cancel("ghost"));

        let handle = sup.start("loop", until_cancelled);
        assert_eq!(handle.state(), TaskState::Running);
        assert!(sup.cancel("loop"));
        assert_ne!(handle.state(), TaskState::Running);

        assert_eq!(handle.join().await, TaskOutcome::Cancelled);
        assert_eq!(handle.state(), TaskState::Done);
        assert!(!sup.cancel("loop"));
    }

    #[tokio::test]
    async fn cancelling_task_gives_up_its_name() {
        let sup = TaskSupervisor::new();
        let old = sup.start("burst", until_cancelled);
        assert!(sup.cancel("burst"));
        assert_eq!(old.state(), TaskState::Cancelling);

        // The old body has not observed the cancel yet on this thread.
        let new = sup.start("burst", until_cancelled);
        assert_ne!(new, old);
        assert_eq!(new.state(), TaskState::Running);

        assert_eq!(old.join().await, TaskOutcome::Cancelled);
        // The old task's exit leaves the newer entry alone.
        assert_eq!(sup.get("burst"), Some(new.clone()));
        assert!(sup.is_running("burst"));

        assert!(sup.shutdown_all().await.is_ok());
        assert!(new.is_finished());
        assert!(sup.is_empty());
    }

    #[tokio::test]
    async fn shutdown_all_waits_for_replaced_tasks() {
        let sup = TaskSupervisor::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let slow_exit = |finished: Arc<AtomicUsize>| {
            move |token: CancellationToken| async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(30)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Cancelled)
            }
        };

        let old = sup.start("burst", slow_exit(Arc::clone(&finished)));
        sup.cancel("burst");
        let new = sup.start("burst", slow_exit(Arc::clone(&finished)));
        assert_ne!(old, new);

        assert!(sup.shutdown_all().await.is_ok());
        assert!(old.is_finished());
        assert!(new.is_finished());
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn start_on_a_shut_down_runtime_returns() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);

        let sup = TaskSupervisor::new();
        let task = {
            let _entered = handle.enter();
            // The spawned future is dropped on this thread while the
            // registry is locked.
            sup.start("late", until_cancelled)
        };
        assert_eq!(task.name(), "late");

        let outcome = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(task.join());
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(task.is_finished());
        assert!(!sup.is_running("late"));
    }

    #[tokio::test]
    async fn health_maps_names_to_liveness() {
        let sup = TaskSupervisor::new();
        sup.start("a", until_cancelled);
        sup.start("b", until_cancelled);

        let health = sup.health();
        assert_eq!(health.len(), 2);
        assert!(health.values().all(|alive| *alive));

        sup.cancel("a");
        wait_until(|| !sup.health().contains_key("a")).await;
        assert_eq!(sup.health().get("b"), Some(&true));
        assert!(sup.shutdown_all().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_all_swallows_cancellation_but_reports_failures() {
        let sup = TaskSupervisor::new();
        let quiet = sup.start("quiet", until_cancelled);
        let noisy = sup.start("noisy", |token: CancellationToken| async move {
            token.cancelled().await;
            Err(GatewayError::Transport("socket closed badly".into()))
        });

        let err = sup.shutdown_all().await.unwrap_err();
        match err {
            GatewayError::TaskFailed { task, details } => {
                assert_eq!(task, "noisy");
                assert!(details.contains("socket closed badly"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(quiet.is_finished());
        assert!(noisy.is_finished());
        assert!(sup.is_empty());
    }

    #[tokio::test]
    async fn panicking_task_is_deregistered_and_failed() {
        let sup = TaskSupervisor::new();
        let handle = sup.start("boom", |_| async {
            if std::hint::black_box(true) {
                panic!("task body exploded");
            }
            Ok::<(), GatewayError>(())
        });

        match handle.join().await {
            TaskOutcome::Failed(GatewayError::TaskFailed { task, .. }) => assert_eq!(task, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(sup.get("boom").is_none());
    }

    #[tokio::test]
    async fn dropping_supervisor_cancels_tasks() {
        let handle = {
            let sup = TaskSupervisor::new();
            sup.start("orphan", until_cancelled)
        };
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.join()).await;
        assert_eq!(outcome.ok(), Some(TaskOutcome::Cancelled));
    }
}
