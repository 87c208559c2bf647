#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    #[error("max_concurrency must be >= 1")]
    ZeroConcurrency,
}

/// Counting admission gate for sandbox executions.
///
/// Not a queue: `try_acquire` never blocks. Releasing more slots than were acquired
/// panics, since it means a caller's bookkeeping is broken.
#[derive(Debug)]
pub struct CapacityLimiter {
    max_concurrency: usize,
    in_use: Mutex<usize>,
}

impl CapacityLimiter {
    pub fn new(max_concurrency: usize) -> Result<Self, CapacityError> {
        if max_concurrency < 1 {
            return Err(CapacityError::ZeroConcurrency);
        }
        Ok(Self {
            max_concurrency,
            in_use: Mutex::new(0),
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn in_use(&self) -> usize {
        *self.lock()
    }

    pub fn available(&self) -> usize {
        self.max_concurrency - *self.lock()
    }

    pub fn try_acquire(&self) -> bool {
        let mut in_use = self.lock();
        if *in_use >= self.max_concurrency {
            return false;
        }
        *in_use += 1;
        true
    }

    pub fn release(&self) {
        let over_released = {
            let mut in_use = self.lock();
            if *in_use == 0 {
                true
            } else {
                *in_use -= 1;
                false
            }
        };
        if over_released {
            panic!(
                "capacity limiter released with no outstanding slot (max_concurrency={})",
                self.max_concurrency
            );
        }
    }

    /// RAII form of `try_acquire`; the slot is released when the permit drops.
    pub fn try_permit(self: &Arc<Self>) -> Option<CapacityPermit> {
        self.try_acquire().then(|| CapacityPermit {
            limiter: Arc::clone(self),
        })
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        // The counter is updated atomically under the guard, so a poisoned lock still
        // holds a consistent value.
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct CapacityPermit {
    limiter: Arc<CapacityLimiter>,
}

impl Drop for CapacityPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
