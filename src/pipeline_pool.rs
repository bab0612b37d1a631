//! Batch pipeline pool (C8): a bounded collection of pre-loaded heavy
//! worker resources — one independent feature-extraction engine per slot —
//! borrowed by the batch worker pool via a blocking, timeout-bounded
//! `acquire`.
//!
//! Grounded on `pipeline_pool.py`'s `PipelinePool` (a `queue.Queue`-backed
//! pool with blocking `get(timeout=...)`/`put`), re-expressed with
//! `crossbeam-channel`'s bounded MPMC channel and a `Drop`-guarded
//! acquisition so the borrowed instance is returned to the pool on every
//! exit path of the critical section — including an early `?` return or a
//! panic — per the scoped-acquisition note in spec §5/§9.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelinePoolError {
    #[error("no pipeline instance available after {0:?} (pool size={1})")]
    Timeout(Duration, usize),
}

impl From<PipelinePoolError> for crate::error::IrisRegError {
    fn from(e: PipelinePoolError) -> Self {
        match e {
            PipelinePoolError::Timeout(d, _) => Self::Timeout(d),
        }
    }
}

/// Bounded pool of pre-loaded `T` instances. `T` is whatever heavy
/// per-thread resource the feature-extraction pipeline needs (each owning
/// its own session/intermediate state) — this crate treats it as an
/// opaque, `Send` value and leaves construction to the caller.
pub struct PipelinePool<T: Send> {
    size: usize,
    sender: Sender<T>,
    receiver: Receiver<T>,
    available: AtomicUsize,
}

impl<T: Send> PipelinePool<T> {
    /// Pre-loads `size` instances by calling `make` once per slot,
    /// synchronously and blocking. Call once at startup.
    pub fn load(size: usize, mut make: impl FnMut(usize) -> T) -> Self {
        let (sender, receiver) = bounded(size.max(1));
        for i in 0..size {
            sender
                .send(make(i))
                .expect("bounded channel sized to `size` has room for every slot during load");
            info!(instance = i + 1, total = size, "pipeline instance loaded");
        }
        info!(size, "pipeline pool ready");
        Self {
            size,
            sender,
            receiver,
            available: AtomicUsize::new(size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// Borrows an instance, blocking the calling thread up to `timeout`.
    /// The channel's FIFO-ish blocking receive approximates the fairness
    /// of `queue.Queue`. The returned guard always returns the instance to
    /// the pool on drop, so callers never need to remember to release.
    pub fn acquire(&self, timeout: Duration) -> Result<PipelineGuard<'_, T>, PipelinePoolError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(instance) => {
                self.available.fetch_sub(1, Ordering::Relaxed);
                Ok(PipelineGuard {
                    pool: self,
                    instance: Some(instance),
                })
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                Err(PipelinePoolError::Timeout(timeout, self.size))
            }
        }
    }

    fn release(&self, instance: T) {
        self.available.fetch_add(1, Ordering::Relaxed);
        // The channel is exactly `size`-bounded and every instance in
        // circulation originated from `load`, so this send never blocks.
        let _ = self.sender.send(instance);
    }
}

/// RAII handle to a borrowed pipeline instance. Scoped acquisition:
/// returns the instance to the pool on every exit path of the borrowing
/// scope, guaranteed via `Drop`, including unwinding.
pub struct PipelineGuard<'a, T: Send> {
    pool: &'a PipelinePool<T>,
    instance: Option<T>,
}

impl<T: Send> std::ops::Deref for PipelineGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.instance.as_ref().expect("instance present until drop")
    }
}

impl<T: Send> std::ops::DerefMut for PipelineGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.instance.as_mut().expect("instance present until drop")
    }
}

impl<T: Send> Drop for PipelineGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.release(instance);
        }
    }
}

/// Per-instance thread-count cap that prevents oversubscription: with
/// `pool_size` pipeline instances each spawning their own worker threads,
/// the combined thread count stays bounded by the available CPUs.
pub fn per_instance_thread_cap(cpu_count: usize, pool_size: usize) -> usize {
    (cpu_count / pool_size.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trips() {
        let pool = PipelinePool::load(2, |i| i);
        assert_eq!(pool.available(), 2);
        {
            let guard = pool.acquire(Duration::from_millis(100)).unwrap();
            assert_eq!(pool.available(), 1);
            assert!(*guard == 0 || *guard == 1);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn acquire_under_full_load_times_out() {
        let pool = PipelinePool::load(1, |_| 0u8);
        let _held = pool.acquire(Duration::from_millis(50)).unwrap();
        let result = pool.acquire(Duration::from_millis(50));
        assert_eq!(result, Err(PipelinePoolError::Timeout(Duration::from_millis(50), 1)));
    }

    #[test]
    fn release_happens_even_on_panic_in_critical_section() {
        let pool = PipelinePool::load(1, |_| 0u8);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = pool.acquire(Duration::from_millis(50)).unwrap();
            panic!("simulated worker failure");
        }));
        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn thread_cap_never_zero() {
        assert_eq!(per_instance_thread_cap(4, 8), 1);
        assert_eq!(per_instance_thread_cap(8, 4), 2);
    }
}
