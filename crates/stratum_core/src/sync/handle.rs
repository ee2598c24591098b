//! # Job Handles
//!
//! A [`JobHandle`] is an opaque token for one unit of pending work. Handles
//! are cheap to clone and shared between the tracker, the worker pool and
//! the caller.
//!
//! ```text
//!   pending ──signal──► complete
//!      │                    │
//!      └─ listeners ────────┴─► fired exactly once, outside the lock
//! ```
//!
//! A handle records the handles it depends on until it completes, so
//! [`JobHandle::depends_on`] can answer transitive coverage questions for
//! every handle that is still outstanding.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique job identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job{}", self.0)
    }
}

/// Callback fired once when a handle completes.
pub(crate) trait CompletionListener: Send + Sync {
    fn on_complete(&self);
}

#[derive(Default)]
struct State {
    done: bool,
    panicked: bool,
    listeners: Vec<Arc<dyn CompletionListener>>,
}

struct Inner {
    id: JobId,
    deps: Mutex<Vec<JobHandle>>,
    state: Mutex<State>,
    cond: Condvar,
    combined: bool,
}

/// Handle to pending or finished work.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<Inner>,
}

impl JobHandle {
    fn with_deps(deps: Vec<JobHandle>, combined: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: JobId::next(),
                deps: Mutex::new(deps),
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
                combined,
            }),
        }
    }

    /// Creates a pending handle for work that runs after `deps`.
    pub(crate) fn pending(deps: Vec<JobHandle>) -> Self {
        Self::with_deps(deps, false)
    }

    /// Creates a handle that is already complete.
    #[must_use]
    pub fn completed() -> Self {
        let handle = Self::with_deps(Vec::new(), false);
        handle.signal(false);
        handle
    }

    /// Creates a handle that completes once every handle in `handles` has.
    ///
    /// The combined handle reports a panic if any input panicked.
    #[must_use]
    pub fn combine(handles: &[JobHandle]) -> Self {
        let combined = Self::with_deps(handles.to_vec(), true);
        let target = combined.clone();
        let inputs = handles.to_vec();
        when_all(handles, move || {
            let panicked = inputs.iter().any(JobHandle::panicked);
            target.signal(panicked);
        });
        combined
    }

    /// Job id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> JobId {
        self.inner.id
    }

    /// Whether this handle was created by [`JobHandle::combine`].
    #[inline]
    #[must_use]
    pub fn is_combined(&self) -> bool {
        self.inner.combined
    }

    /// Checks if the work has finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().done
    }

    /// Checks if the work finished by panicking.
    #[must_use]
    pub fn panicked(&self) -> bool {
        let state = self.inner.state.lock();
        state.done && state.panicked
    }

    /// Blocks until the work has finished. No timeout.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.done {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Direct dependencies still recorded. Empty once complete.
    #[must_use]
    pub fn dependencies(&self) -> Vec<JobHandle> {
        self.inner.deps.lock().clone()
    }

    /// Checks whether completing `self` implies `other` has completed.
    ///
    /// True when `other` is `self`, is complete, or is reachable through
    /// recorded dependencies.
    #[must_use]
    pub fn depends_on(&self, other: &JobHandle) -> bool {
        if other.is_complete() {
            return true;
        }
        let mut stack = vec![self.clone()];
        let mut visited = Vec::new();
        while let Some(handle) = stack.pop() {
            if handle == *other {
                return true;
            }
            if visited.contains(&handle.id()) {
                continue;
            }
            visited.push(handle.id());
            stack.extend(handle.dependencies());
        }
        false
    }

    /// Marks the work finished, wakes waiters and fires listeners.
    pub(crate) fn signal(&self, panicked: bool) {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            state.panicked = panicked;
            std::mem::take(&mut state.listeners)
        };
        self.inner.cond.notify_all();
        self.inner.deps.lock().clear();
        for listener in listeners {
            listener.on_complete();
        }
    }

    /// Registers a listener, firing it immediately if already complete.
    pub(crate) fn subscribe(&self, listener: Arc<dyn CompletionListener>) {
        {
            let mut state = self.inner.state.lock();
            if !state.done {
                state.listeners.push(listener);
                return;
            }
        }
        listener.on_complete();
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for JobHandle {}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.inner.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Runs an action once every handle has completed.
///
/// The counter starts one above the handle count; the extra guard tick is
/// released after every subscription is in place, so the action cannot fire
/// while handles are still being registered.
struct Countdown {
    remaining: AtomicUsize,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CompletionListener for Countdown {
    fn on_complete(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(action) = self.action.lock().take() {
                action();
            }
        }
    }
}

/// Calls `action` after every handle in `handles` completes; immediately
/// (on this thread) if they already have.
pub(crate) fn when_all(handles: &[JobHandle], action: impl FnOnce() + Send + 'static) {
    let countdown = Arc::new(Countdown {
        remaining: AtomicUsize::new(handles.len() + 1),
        action: Mutex::new(Some(Box::new(action))),
    });
    for handle in handles {
        handle.subscribe(Arc::clone(&countdown) as Arc<dyn CompletionListener>);
    }
    countdown.on_complete();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_completed_handle() {
        let handle = JobHandle::completed();
        assert!(handle.is_complete());
        assert!(!handle.panicked());
        handle.wait();
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let handle = JobHandle::pending(Vec::new());
        let remote = handle.clone();
        let waiter = std::thread::spawn(move || {
            remote.wait();
            remote.is_complete()
        });
        std::thread::sleep(Duration::from_millis(20));
        handle.signal(false);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_depends_on_is_transitive() {
        let a = JobHandle::pending(Vec::new());
        let b = JobHandle::pending(vec![a.clone()]);
        let c = JobHandle::pending(vec![b.clone()]);
        let unrelated = JobHandle::pending(Vec::new());

        assert!(c.depends_on(&a));
        assert!(c.depends_on(&c));
        assert!(!a.depends_on(&c));
        assert!(!c.depends_on(&unrelated));

        unrelated.signal(false);
        assert!(c.depends_on(&unrelated));
    }

    #[test]
    fn test_combine_waits_for_all() {
        let a = JobHandle::pending(Vec::new());
        let b = JobHandle::pending(Vec::new());
        let both = JobHandle::combine(&[a.clone(), b.clone()]);
        assert!(both.is_combined());
        assert!(both.depends_on(&a));

        a.signal(false);
        assert!(!both.is_complete());
        b.signal(true);
        assert!(both.is_complete());
        assert!(both.panicked());
    }

    #[test]
    fn test_combine_of_nothing_is_complete() {
        assert!(JobHandle::combine(&[]).is_complete());
    }

    #[test]
    fn test_when_all_fires_once() {
        let a = JobHandle::pending(Vec::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        when_all(&[a.clone(), a.clone()], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        a.signal(false);
        a.signal(false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_when_all_on_completed_runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        when_all(&[JobHandle::completed()], move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }
}
