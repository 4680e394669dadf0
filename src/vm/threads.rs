//! Execution units.
//!
//! An execution unit runs one callable on its own OS thread:
//! - `NotStarted --start--> Running --(execute returns)--> Completed`
//! - each run gets an isolated [`ExecutionContext`]
//! - cancellation is cooperative by default; abrupt termination is an
//!   explicitly unsafe opt-in on unix

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::Value;
use super::heap::{GcRef, RootId};
use super::runtime::Runtime;

/// Unit ID counter for generating unique IDs.
static NEXT_UNIT_ID: AtomicUsize = AtomicUsize::new(1);

fn next_unit_id() -> usize {
    NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed)
}

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;

/// Lifecycle state of an [`ExecutionUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitState {
    NotStarted = NOT_STARTED,
    Running = RUNNING,
    Completed = COMPLETED,
}

impl UnitState {
    pub fn code(self) -> u8 {
        self as u8
    }

    fn from_code(code: u8) -> Self {
        match code {
            NOT_STARTED => UnitState::NotStarted,
            RUNNING => UnitState::Running,
            _ => UnitState::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("cannot start an exited unit")]
    Exited,
    #[error("unit already in running state")]
    AlreadyRunning,
    #[error("value of type {0} is not callable")]
    NotCallable(&'static str),
    /// Thread creation, join or cancellation failed at the OS level
    #[error("{0}")]
    Os(String),
    #[error("unit thread panicked: {0}")]
    Panicked(String),
}

/// Shared cancellation flag, polled by executors at safe points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Runs a callable to completion inside an execution context.
///
/// This is the interpreter's side of an execution unit. Long-running
/// executors should call [`ExecutionContext::checkpoint`] regularly so that
/// [`ExecutionUnit::cancel`] takes effect.
pub trait Execute: Send + Sync {
    fn execute(&self, callable: Value, ctx: &mut ExecutionContext) -> Result<Value, String>;
}

struct FnExecutor<F>(F);

impl<F> Execute for FnExecutor<F>
where
    F: Fn(Value, &mut ExecutionContext) -> Result<Value, String> + Send + Sync,
{
    fn execute(&self, callable: Value, ctx: &mut ExecutionContext) -> Result<Value, String> {
        (self.0)(callable, ctx)
    }
}

/// Wrap a function as an [`Execute`] implementation.
pub fn executor_fn<F>(f: F) -> Arc<dyn Execute>
where
    F: Fn(Value, &mut ExecutionContext) -> Result<Value, String> + Send + Sync + 'static,
{
    Arc::new(FnExecutor(f))
}

// =============================================================================
// ExecutionContext
// =============================================================================

/// Per-run state handed to the executor.
///
/// Values pushed on the stack are GC roots until popped or until the
/// context is dropped.
pub struct ExecutionContext {
    unit_id: usize,
    runtime: Arc<Runtime>,
    stack: Vec<(Value, RootId)>,
    cancel: CancelToken,
}

impl ExecutionContext {
    fn new(unit_id: usize, runtime: Arc<Runtime>, cancel: CancelToken) -> Self {
        Self {
            unit_id,
            runtime,
            stack: Vec::new(),
            cancel,
        }
    }

    pub fn unit_id(&self) -> usize {
        self.unit_id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn push(&mut self, value: Value) {
        let root = self.runtime.heap().pin(value);
        self.stack.push((value, root));
    }

    /// Intern `chars` and push the string, so it stays rooted for the run.
    pub fn intern(&mut self, chars: impl AsRef<[u8]>) -> GcRef {
        let runtime = Arc::clone(&self.runtime);
        let (s, _guard) = runtime.intern_rooted(chars);
        self.push(Value::Obj(s));
        s
    }

    pub fn pop(&mut self) -> Option<Value> {
        let (value, root) = self.stack.pop()?;
        self.runtime.heap().unpin(root);
        Some(value)
    }

    /// Value `distance` slots below the top of the stack.
    pub fn peek(&self, distance: usize) -> Option<Value> {
        let index = self.stack.len().checked_sub(distance + 1)?;
        self.stack.get(index).map(|(v, _)| *v)
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point: fails once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), String> {
        if self.is_cancelled() {
            Err("cancelled".to_string())
        } else {
            Ok(())
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        let heap = self.runtime.heap();
        for (_, root) in self.stack.drain(..) {
            heap.unpin(root);
        }
    }
}

// =============================================================================
// ExecutionUnit
// =============================================================================

struct Shared {
    runtime: Arc<Runtime>,
    state: AtomicU8,
    done: Mutex<bool>,
    done_cv: Condvar,
    result: Mutex<Option<Result<Value, String>>>,
    /// Keeps a successful result alive until both the unit and its thread
    /// are gone
    result_root: Mutex<Option<RootId>>,
    cancel: CancelToken,
}

impl Shared {
    fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            state: AtomicU8::new(NOT_STARTED),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            result: Mutex::new(None),
            result_root: Mutex::new(None),
            cancel: CancelToken::new(),
        }
    }

    /// Record the outcome and move to Completed, taking ownership of `root`.
    /// Only the first call has any effect; later roots are released.
    fn finish(&self, result: Result<Value, String>, root: Option<RootId>) {
        let mut done = self.done.lock();
        if *done {
            if let Some(root) = root {
                self.runtime.heap().unpin(root);
            }
            return;
        }
        *self.result_root.lock() = root;
        *self.result.lock() = Some(result);
        self.state.store(COMPLETED, Ordering::Release);
        *done = true;
        self.done_cv.notify_all();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(root) = self.result_root.get_mut().take() {
            self.runtime.heap().unpin(root);
        }
    }
}

/// A callable bound to a runtime, runnable once on its own thread.
pub struct ExecutionUnit {
    id: usize,
    runtime: Arc<Runtime>,
    executor: Arc<dyn Execute>,
    callable: Value,
    root: RootId,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionUnit {
    /// Create a NotStarted unit. `callable` must be a function or closure.
    pub fn new(
        runtime: Arc<Runtime>,
        callable: Value,
        executor: Arc<dyn Execute>,
    ) -> Result<Self, UnitError> {
        match runtime.object_type(&callable) {
            Some("function") | Some("closure") => {}
            Some(other) => return Err(UnitError::NotCallable(other)),
            None => return Err(UnitError::NotCallable(callable.type_name())),
        }
        Ok(Self::build(runtime, callable, executor))
    }

    fn build(runtime: Arc<Runtime>, callable: Value, executor: Arc<dyn Execute>) -> Self {
        let root = runtime.heap().pin(callable);
        let shared = Arc::new(Shared::new(Arc::clone(&runtime)));
        Self {
            id: next_unit_id(),
            runtime,
            executor,
            callable,
            root,
            shared,
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn callable(&self) -> Value {
        self.callable
    }

    pub fn state(&self) -> UnitState {
        UnitState::from_code(self.shared.state.load(Ordering::Acquire))
    }

    /// What `execute` returned, once the unit has completed.
    pub fn result(&self) -> Option<Result<Value, String>> {
        self.shared.result.lock().clone()
    }

    /// Spawn the unit's thread and begin executing the callable.
    pub fn start(&self) -> Result<(), UnitError> {
        if let Err(code) = self.shared.state.compare_exchange(
            NOT_STARTED,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(if code == COMPLETED {
                UnitError::Exited
            } else {
                UnitError::AlreadyRunning
            });
        }

        let config = self.runtime.config();
        let mut builder =
            thread::Builder::new().name(format!("{}-{}", config.unit_name_prefix, self.id));
        if let Some(size) = config.unit_stack_size {
            builder = builder.stack_size(size);
        }

        let id = self.id;
        let runtime = Arc::clone(&self.runtime);
        let executor = Arc::clone(&self.executor);
        let shared = Arc::clone(&self.shared);
        let callable = self.callable;

        let mut handle = self.handle.lock();
        match builder.spawn(move || run(id, runtime, executor, shared, callable)) {
            Ok(h) => {
                *handle = Some(h);
                log::debug!("unit {} started", id);
                Ok(())
            }
            Err(e) => {
                // Joiners that saw Running are waiting on `done`
                let _done = self.shared.done.lock();
                self.shared.state.store(NOT_STARTED, Ordering::Release);
                self.shared.done_cv.notify_all();
                log::warn!("unit {} failed to spawn: {}", id, e);
                Err(UnitError::Os(e.to_string()))
            }
        }
    }

    /// Block until a running unit's thread terminates.
    ///
    /// Returns immediately for a NotStarted or Completed unit.
    pub fn join(&self) -> Result<(), UnitError> {
        if self.state() != UnitState::Running {
            let mut handle = self.handle.lock();
            if handle.as_ref().is_some_and(|h| h.is_finished()) {
                let h = handle.take();
                drop(handle);
                return reap(h);
            }
            return Ok(());
        }

        {
            let mut done = self.shared.done.lock();
            while !*done && self.shared.state.load(Ordering::Acquire) == RUNNING {
                self.shared.done_cv.wait(&mut done);
            }
        }
        let h = self.handle.lock().take();
        reap(h)
    }

    /// Request cooperative cancellation of a running unit.
    ///
    /// The executor observes it at its next [`ExecutionContext::checkpoint`].
    pub fn cancel(&self) -> Result<(), UnitError> {
        if self.state() == UnitState::Running {
            self.shared.cancel.cancel();
            log::debug!("unit {} cancellation requested", self.id);
        }
        Ok(())
    }

    /// Terminate a running unit's thread at whatever point it has reached.
    ///
    /// On success the unit is Completed with an `Err("cancelled")` result and
    /// its thread is detached.
    ///
    /// # Safety
    ///
    /// The thread may be stopped while holding locks or halfway through
    /// mutating runtime objects. Nothing it was doing is cleaned up, and no
    /// guarantee is made about the state of anything it could reach.
    ///
    /// Cancellation is deferred: the thread only stops at its next
    /// cancellation point (a blocking call such as `sleep`, `read` or a
    /// condition wait). The unit reports Completed as soon as this returns,
    /// while the thread may keep running until it reaches such a point, or
    /// forever if it never does.
    #[cfg(unix)]
    pub unsafe fn cancel_abruptly(&self) -> Result<(), UnitError> {
        use std::os::unix::thread::JoinHandleExt;

        if self.state() != UnitState::Running {
            return Ok(());
        }
        let mut handle = self.handle.lock();
        if self.state() != UnitState::Running {
            return Ok(());
        }
        let Some(h) = handle.as_ref() else {
            return Ok(());
        };

        // SAFETY: the thread has not been joined, so its pthread_t is valid.
        let rc = unsafe { libc::pthread_cancel(h.as_pthread_t()) };
        if rc != 0 {
            return Err(UnitError::Os(
                std::io::Error::from_raw_os_error(rc).to_string(),
            ));
        }
        handle.take();
        drop(handle);

        self.shared.finish(Err("cancelled".to_string()), None);
        log::debug!("unit {} cancelled abruptly", self.id);
        Ok(())
    }

    /// A new NotStarted unit sharing this unit's callable, executor and runtime.
    pub fn copy(&self) -> ExecutionUnit {
        Self::build(
            Arc::clone(&self.runtime),
            self.callable,
            Arc::clone(&self.executor),
        )
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        self.runtime.heap().unpin(self.root);
    }
}

impl std::fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("callable", &self.callable)
            .finish()
    }
}

fn run(
    id: usize,
    runtime: Arc<Runtime>,
    executor: Arc<dyn Execute>,
    shared: Arc<Shared>,
    callable: Value,
) {
    let mut ctx = ExecutionContext::new(id, Arc::clone(&runtime), shared.cancel.clone());
    ctx.push(callable);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(callable, &mut ctx)));
    let result = outcome.unwrap_or_else(|payload| Err(panic_message(&*payload)));

    // Pin the result before the stack roots go away
    let root = result.as_ref().ok().map(|v| runtime.heap().pin(*v));
    drop(ctx);

    log::debug!("unit {} finished (ok: {})", id, result.is_ok());
    shared.finish(result, root);
}

fn reap(handle: Option<JoinHandle<()>>) -> Result<(), UnitError> {
    match handle {
        Some(h) => h
            .join()
            .map_err(|payload| UnitError::Panicked(panic_message(&*payload))),
        None => Ok(()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
