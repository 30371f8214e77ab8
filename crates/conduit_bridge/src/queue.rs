//! Execution Contexts
//!
//! An execution context is an independently ordered unit of sequential (or
//! concurrent) execution to which work is submitted. Serial contexts are
//! dedicated, named OS threads draining a channel of boxed work items; the
//! concurrent context is a small multi-threaded tokio runtime.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::LifecycleError;

/// A unit of work submitted to a context.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Identifies the context a module's calls run on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// The UI-affinity context
    Main,
    /// The script-affinity context
    Script,
    /// A named serial context
    Serial(String),
    /// The shared concurrent context
    Concurrent,
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextKey::Main => write!(f, "main"),
            ContextKey::Script => write!(f, "script"),
            ContextKey::Serial(label) => write!(f, "{}", label),
            ContextKey::Concurrent => write!(f, "concurrent"),
        }
    }
}

/// A context that accepts work.
pub trait WorkQueue: Send + Sync + 'static {
    /// Label used for the thread name and in logs.
    fn label(&self) -> &str;

    /// Submit work. Work submitted to a serial queue runs in submission order.
    fn submit(&self, work: Work) -> Result<(), LifecycleError>;

    /// Whether the calling thread belongs to this queue.
    fn is_current(&self) -> bool;

    /// Stop accepting work. Work already queued still runs.
    fn shutdown(&self);
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_contained(label: &str, work: Work) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(work)) {
        tracing::error!(queue = %label, "Work item panicked: {}", panic_message(&panic));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serial Queue
// ─────────────────────────────────────────────────────────────────────────────

/// A dedicated thread running submitted work one item at a time.
pub struct SerialQueue {
    label: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Work>>>,
    thread_id: ThreadId,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SerialQueue {
    /// Spawn the queue's thread.
    pub fn spawn(label: impl Into<String>) -> Result<Arc<Self>, LifecycleError> {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Work>();

        let name = label.clone();
        let thread_handle = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                tracing::debug!(queue = %name, "Execution context started");
                while let Some(work) = rx.blocking_recv() {
                    run_contained(&name, work);
                }
                tracing::debug!(queue = %name, "Execution context exiting");
            })
            .map_err(|e| {
                tracing::error!(queue = %label, "Failed to spawn context thread: {}", e);
                LifecycleError::ContextSpawn(label.clone())
            })?;

        Ok(Arc::new(Self {
            thread_id: thread_handle.thread().id(),
            label,
            tx: Mutex::new(Some(tx)),
            thread_handle: Mutex::new(Some(thread_handle)),
        }))
    }

    /// Wait for the queue's thread to finish. Call after `shutdown`.
    pub fn join(&self) {
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl WorkQueue for SerialQueue {
    fn label(&self) -> &str {
        &self.label
    }

    fn submit(&self, work: Work) -> Result<(), LifecycleError> {
        let tx = self.tx.lock();
        let tx = tx
            .as_ref()
            .ok_or_else(|| LifecycleError::ContextClosed(self.label.clone()))?;
        tx.send(work)
            .map_err(|_| LifecycleError::ContextClosed(self.label.clone()))
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn shutdown(&self) {
        if self.tx.lock().take().is_some() {
            tracing::debug!(queue = %self.label, "Execution context shut down");
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrent Queue
// ─────────────────────────────────────────────────────────────────────────────

/// A pool of threads running submitted work in no particular order.
pub struct ConcurrentQueue {
    label: String,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl ConcurrentQueue {
    pub fn spawn(label: impl Into<String>, threads: usize) -> Result<Arc<Self>, LifecycleError> {
        let label = label.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name(label.clone())
            .enable_all()
            .build()
            .map_err(|e| {
                tracing::error!(queue = %label, "Failed to build concurrent context: {}", e);
                LifecycleError::ContextSpawn(label.clone())
            })?;

        Ok(Arc::new(Self {
            label,
            runtime: Mutex::new(Some(runtime)),
        }))
    }
}

impl WorkQueue for ConcurrentQueue {
    fn label(&self) -> &str {
        &self.label
    }

    fn submit(&self, work: Work) -> Result<(), LifecycleError> {
        let runtime = self.runtime.lock();
        let runtime = runtime
            .as_ref()
            .ok_or_else(|| LifecycleError::ContextClosed(self.label.clone()))?;
        let label = self.label.clone();
        runtime.spawn_blocking(move || run_contained(&label, work));
        Ok(())
    }

    fn is_current(&self) -> bool {
        thread::current().name() == Some(self.label.as_str())
    }

    fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for ConcurrentQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Run a closure on a queue and await its result.
pub async fn run_on<Q, T, F>(queue: &Q, f: F) -> Result<T, LifecycleError>
where
    Q: WorkQueue + ?Sized,
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (reply_tx, reply_rx) = oneshot::channel();
    queue.submit(Box::new(move || {
        let _ = reply_tx.send(f());
    }))?;
    reply_rx
        .await
        .map_err(|_| LifecycleError::ContextClosed(queue.label().to_string()))
}

/// Tracks units of work spread across contexts so they can be joined.
#[derive(Default)]
pub struct DispatchGroup {
    pending: Mutex<Vec<oneshot::Receiver<()>>>,
}

/// Held by a tracked unit of work; the unit completes when the token drops.
pub struct GroupToken {
    _done: oneshot::Sender<()>,
}

impl DispatchGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a unit of work.
    pub fn enter(&self) -> GroupToken {
        let (done, rx) = oneshot::channel();
        self.pending.lock().push(rx);
        GroupToken { _done: done }
    }

    /// Number of units entered and not yet waited for.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every entered unit has completed.
    pub async fn wait(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        join_all(pending).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context Set
// ─────────────────────────────────────────────────────────────────────────────

/// All contexts of one bridge generation.
///
/// Named serial contexts and the concurrent context are spawned on first use.
pub struct ContextSet {
    main: Arc<dyn WorkQueue>,
    script: Arc<SerialQueue>,
    serial: DashMap<String, Arc<SerialQueue>>,
    concurrent: Mutex<Option<Arc<ConcurrentQueue>>>,
    concurrent_label: String,
}

impl ContextSet {
    pub fn new(main: Arc<dyn WorkQueue>, script_label: &str) -> Result<Self, LifecycleError> {
        Ok(Self {
            main,
            script: SerialQueue::spawn(script_label)?,
            serial: DashMap::new(),
            concurrent: Mutex::new(None),
            concurrent_label: format!("{}.concurrent", script_label),
        })
    }

    pub fn main(&self) -> &Arc<dyn WorkQueue> {
        &self.main
    }

    pub fn script(&self) -> &Arc<SerialQueue> {
        &self.script
    }

    /// The queue for a context key, spawning it if needed.
    pub fn queue_for(&self, key: &ContextKey) -> Result<Arc<dyn WorkQueue>, LifecycleError> {
        match key {
            ContextKey::Main => Ok(Arc::clone(&self.main)),
            ContextKey::Script => Ok(Arc::clone(&self.script) as Arc<dyn WorkQueue>),
            ContextKey::Serial(label) => {
                let queue = self
                    .serial
                    .entry(label.clone())
                    .or_try_insert_with(|| SerialQueue::spawn(label.clone()))?;
                Ok(Arc::clone(queue.value()) as Arc<dyn WorkQueue>)
            }
            ContextKey::Concurrent => {
                let mut concurrent = self.concurrent.lock();
                if let Some(queue) = concurrent.as_ref() {
                    return Ok(Arc::clone(queue) as Arc<dyn WorkQueue>);
                }
                let queue = ConcurrentQueue::spawn(self.concurrent_label.clone(), 4)?;
                *concurrent = Some(Arc::clone(&queue));
                Ok(queue as Arc<dyn WorkQueue>)
            }
        }
    }

    /// Shut down every context this generation owns. The main context belongs
    /// to the host and stays up.
    pub fn shutdown(&self) {
        self.script.shutdown();
        for queue in self.serial.iter() {
            queue.value().shutdown();
        }
        if let Some(queue) = self.concurrent.lock().take() {
            queue.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_serial_queue_preserves_order() {
        let queue = SerialQueue::spawn("test.serial").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let seen = Arc::clone(&seen);
            queue.submit(Box::new(move || seen.lock().push(i))).unwrap();
        }
        run_on(queue.as_ref(), || ()).await.unwrap();

        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_run_on_returns_value_from_queue_thread() {
        let queue = SerialQueue::spawn("test.run_on").unwrap();
        let queued = Arc::clone(&queue);
        let (name, current) = run_on(queue.as_ref(), move || {
            (
                thread::current().name().map(str::to_string),
                queued.is_current(),
            )
        })
        .await
        .unwrap();

        assert_eq!(name.as_deref(), Some("test.run_on"));
        assert!(current);
        assert!(!queue.is_current());
    }

    #[tokio::test]
    async fn test_panicking_work_does_not_kill_queue() {
        let queue = SerialQueue::spawn("test.panic").unwrap();
        queue.submit(Box::new(|| panic!("boom"))).unwrap();

        let result = run_on(queue.as_ref(), || 7).await.unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let queue = SerialQueue::spawn("test.shutdown").unwrap();
        queue.shutdown();
        queue.join();

        let err = queue.submit(Box::new(|| {})).unwrap_err();
        assert_eq!(err, LifecycleError::ContextClosed("test.shutdown".into()));
    }

    #[tokio::test]
    async fn test_dispatch_group_waits_for_all_units() {
        let group = DispatchGroup::new();
        let done = Arc::new(AtomicUsize::new(0));
        let queues: Vec<_> = (0..3)
            .map(|i| SerialQueue::spawn(format!("test.group.{}", i)).unwrap())
            .collect();

        for queue in &queues {
            let token = group.enter();
            let done = Arc::clone(&done);
            queue
                .submit(Box::new(move || {
                    thread::sleep(std::time::Duration::from_millis(10));
                    done.fetch_add(1, Ordering::SeqCst);
                    drop(token);
                }))
                .unwrap();
        }

        assert_eq!(group.len(), 3);
        group.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_context_set_reuses_named_contexts() {
        let main = SerialQueue::spawn("test.main").unwrap();
        let contexts = ContextSet::new(main, "test.script").unwrap();

        let a = contexts.queue_for(&ContextKey::Serial("TimingQueue".into())).unwrap();
        let b = contexts.queue_for(&ContextKey::Serial("TimingQueue".into())).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.label(), "TimingQueue");

        let concurrent = contexts.queue_for(&ContextKey::Concurrent).unwrap();
        assert_eq!(run_on(concurrent.as_ref(), || 1 + 1).await.unwrap(), 2);

        contexts.shutdown();
        assert!(contexts.script().submit(Box::new(|| {})).is_err());
        assert!(a.submit(Box::new(|| {})).is_err());
    }
}
