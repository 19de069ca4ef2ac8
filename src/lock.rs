//! Lock module: the execution lock between the audio thread and the worker.
//!
//! A single atomic flag with three states. The audio side only ever tries
//! once and never waits; the worker side may spin and yield until the
//! audio thread lets go. Access to the protected value goes through an
//! [`ExecGuard`], which releases the flag on every exit path.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const AUDIO: u8 = 1;
const WORKER: u8 = 2;

/// Spins before the worker starts yielding its time slice.
const SPIN_LIMIT: u32 = 64;

/// Who holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Audio,
    Worker,
}

impl LockState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            AUDIO => LockState::Audio,
            WORKER => LockState::Worker,
            _ => LockState::Idle,
        }
    }
}

/// Non-reentrant mutual exclusion with a non-blocking audio side.
pub struct ExecLock<T> {
    state: AtomicU8,
    value: UnsafeCell<T>,
}

// SAFETY: the value is only reachable through a guard, and at most one
// guard exists at a time (enforced by the `state` compare-exchange).
unsafe impl<T: Send> Send for ExecLock<T> {}
unsafe impl<T: Send> Sync for ExecLock<T> {}

impl<T> ExecLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            value: UnsafeCell::new(value),
        }
    }

    /// Audio side: acquire if idle, otherwise return `None` immediately.
    #[inline]
    pub fn try_lock(&self) -> Option<ExecGuard<'_, T>> {
        self.state
            .compare_exchange(IDLE, AUDIO, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ExecGuard {
                lock: self,
                owner: LockState::Audio,
            })
    }

    /// Worker side: wait until the lock is idle, then take it.
    pub fn lock(&self) -> ExecGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            if self
                .state
                .compare_exchange_weak(IDLE, WORKER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return ExecGuard {
                    lock: self,
                    owner: LockState::Worker,
                };
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Current holder.
    pub fn state(&self) -> LockState {
        LockState::from_raw(self.state.load(Ordering::Relaxed))
    }

    /// Exclusive access without locking, through a unique borrow.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T> fmt::Debug for ExecLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecLock")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Scoped ownership of the execution lock.
pub struct ExecGuard<'a, T> {
    lock: &'a ExecLock<T>,
    owner: LockState,
}

impl<T> ExecGuard<'_, T> {
    /// Which side acquired this guard.
    pub fn owner(&self) -> LockState {
        self.owner
    }
}

impl<T> Deref for ExecGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for ExecGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for ExecGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(IDLE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn audio_try_lock_fails_while_worker_holds() {
        let lock = ExecLock::new(0u32);
        let guard = lock.lock();
        assert_eq!(lock.state(), LockState::Worker);
        assert_eq!(guard.owner(), LockState::Worker);
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert_eq!(lock.state(), LockState::Idle);
        let audio = lock.try_lock().unwrap();
        assert_eq!(audio.owner(), LockState::Audio);
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn guard_releases_on_early_return() {
        fn bump(lock: &ExecLock<u32>, fail: bool) -> Result<(), ()> {
            let mut guard = lock.try_lock().ok_or(())?;
            *guard += 1;
            if fail {
                return Err(());
            }
            *guard += 1;
            Ok(())
        }
        let lock = ExecLock::new(0u32);
        assert!(bump(&lock, true).is_err());
        assert_eq!(lock.state(), LockState::Idle);
        assert!(bump(&lock, false).is_ok());
        assert_eq!(lock.into_inner(), 3);
    }

    #[test]
    fn worker_waits_for_audio() {
        let lock = Arc::new(ExecLock::new(Vec::<u8>::new()));
        let audio = lock.try_lock().unwrap();
        let worker_lock = Arc::clone(&lock);
        let worker = thread::spawn(move || {
            let mut guard = worker_lock.lock();
            guard.push(2);
        });
        thread::sleep(std::time::Duration::from_millis(20));
        let mut audio = audio;
        audio.push(1);
        drop(audio);
        worker.join().unwrap();
        let mut lock = Arc::try_unwrap(lock).unwrap();
        assert_eq!(lock.get_mut().as_slice(), &[1, 2]);
    }
}
