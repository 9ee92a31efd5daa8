//! Lock disciplines guarding a context's match structures.
//!
//! Every mutation of a context's queues happens under its [`ContextLock`].
//! The discipline is chosen once from [`LockKind`]:
//!
//! - `Spin`: busy-wait spinlock, for one dedicated poller per context.
//! - `Mutex`: blocking mutex, for oversubscribed or shared contexts.
//! - `MutexDebug`: blocking mutex that tracks its owner; re-acquiring it on
//!   the owning thread is a fatal fault instead of a silent deadlock.
//! - `MutexDebugLogContention`: as above, and logs every contended
//!   acquisition.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::config::LockKind;
use crate::error::{Error, fatal};

const NO_OWNER: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(NO_OWNER) };
}

/// Small non-zero integer unique to the calling thread.
fn thread_token() -> u64 {
    THREAD_TOKEN.with(|t| {
        let mut v = t.get();
        if v == NO_OWNER {
            v = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
            t.set(v);
        }
        v
    })
}

struct DebugMutex<T> {
    inner: parking_lot::Mutex<T>,
    owner: AtomicU64,
    contended: AtomicU64,
    log_contention: bool,
}

enum Inner<T> {
    Spin(spin::Mutex<T>),
    Mutex(parking_lot::Mutex<T>),
    Debug(DebugMutex<T>),
}

/// Lock around one context's matching state.
pub struct ContextLock<T> {
    kind: LockKind,
    inner: Inner<T>,
}

impl<T> ContextLock<T> {
    pub fn new(kind: LockKind, value: T) -> Self {
        let inner = match kind {
            LockKind::Spin => Inner::Spin(spin::Mutex::new(value)),
            LockKind::Mutex => Inner::Mutex(parking_lot::Mutex::new(value)),
            LockKind::MutexDebug | LockKind::MutexDebugLogContention => Inner::Debug(DebugMutex {
                inner: parking_lot::Mutex::new(value),
                owner: AtomicU64::new(NO_OWNER),
                contended: AtomicU64::new(0),
                log_contention: kind == LockKind::MutexDebugLogContention,
            }),
        };
        Self { kind, inner }
    }

    #[inline]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Contended acquisitions seen so far. Only the debug disciplines count.
    pub fn contention_count(&self) -> u64 {
        match &self.inner {
            Inner::Debug(d) => d.contended.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    /// Acquire the lock.
    ///
    /// # Panics
    ///
    /// Under a debug discipline, panics if the calling thread already holds
    /// the lock.
    pub fn lock(&self) -> LockGuard<'_, T> {
        match &self.inner {
            Inner::Spin(m) => LockGuard::Spin(m.lock()),
            Inner::Mutex(m) => LockGuard::Mutex(m.lock()),
            Inner::Debug(d) => {
                let me = thread_token();
                if d.owner.load(Ordering::Acquire) == me {
                    fatal(Error::RecursiveLock);
                }
                let guard = match d.inner.try_lock() {
                    Some(g) => g,
                    None => {
                        let n = d.contended.fetch_add(1, Ordering::Relaxed) + 1;
                        if d.log_contention {
                            warn!(contended = n, "context lock contended");
                        }
                        d.inner.lock()
                    }
                };
                d.owner.store(me, Ordering::Release);
                LockGuard::Debug {
                    guard,
                    owner: &d.owner,
                }
            }
        }
    }

    /// Acquire the lock if it is free.
    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        match &self.inner {
            Inner::Spin(m) => m.try_lock().map(LockGuard::Spin),
            Inner::Mutex(m) => m.try_lock().map(LockGuard::Mutex),
            Inner::Debug(d) => {
                let guard = d.inner.try_lock()?;
                d.owner.store(thread_token(), Ordering::Release);
                Some(LockGuard::Debug {
                    guard,
                    owner: &d.owner,
                })
            }
        }
    }
}

/// Guard returned by [`ContextLock::lock`].
pub enum LockGuard<'a, T> {
    Spin(spin::MutexGuard<'a, T>),
    Mutex(parking_lot::MutexGuard<'a, T>),
    Debug {
        guard: parking_lot::MutexGuard<'a, T>,
        owner: &'a AtomicU64,
    },
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            LockGuard::Spin(g) => g,
            LockGuard::Mutex(g) => g,
            LockGuard::Debug { guard, .. } => guard,
        }
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            LockGuard::Spin(g) => g,
            LockGuard::Mutex(g) => g,
            LockGuard::Debug { guard, .. } => guard,
        }
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        // Clear ownership before the inner guard releases the mutex.
        if let LockGuard::Debug { owner, .. } = self {
            owner.store(NO_OWNER, Ordering::Release);
        }
    }
}
