//! Lock-wrapped device for concurrent callers.
//!
//! TEAM_452: The kernel used to hold `BLOCK_DEVICE` locked for a whole
//! transfer. Here the lock is taken per step (submit, then each poll) so
//! several callers can have requests in flight at once.
//!
//! An interrupt that finds the lock taken only sets `irq_pending`. Every
//! [`SharedGuard`] services that flag before it lets go, so the interrupt
//! is acknowledged even when the handler could not get in.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use los_virtio::{RegisterPort, VirtioHal};

use crate::device::{VirtioBlk, backoff};
use crate::error::BlockError;
use crate::poller::RequestToken;
use crate::request::{BlockRequest, GET_SIZE_LEN};

pub struct SharedVirtioBlk<H: VirtioHal, P: RegisterPort> {
    inner: Mutex<VirtioBlk<H, P>>,
    irq_pending: AtomicBool,
}

/// Exclusive access to the device. Deferred interrupts are handled on drop.
pub struct SharedGuard<'a, H: VirtioHal, P: RegisterPort> {
    shared: &'a SharedVirtioBlk<H, P>,
    guard: ManuallyDrop<MutexGuard<'a, VirtioBlk<H, P>>>,
}

impl<H: VirtioHal, P: RegisterPort> SharedVirtioBlk<H, P> {
    pub fn new(device: VirtioBlk<H, P>) -> Self {
        Self {
            inner: Mutex::new(device),
            irq_pending: AtomicBool::new(false),
        }
    }

    /// Exclusive access for anything not wrapped here.
    pub fn lock(&self) -> SharedGuard<'_, H, P> {
        SharedGuard {
            shared: self,
            guard: ManuallyDrop::new(self.inner.lock()),
        }
    }

    fn try_lock(&self) -> Option<SharedGuard<'_, H, P>> {
        self.inner.try_lock().map(|guard| SharedGuard {
            shared: self,
            guard: ManuallyDrop::new(guard),
        })
    }

    pub fn into_inner(self) -> VirtioBlk<H, P> {
        self.inner.into_inner()
    }

    /// Run the device's interrupt path while a deferred interrupt is flagged.
    fn service(&self, dev: &mut VirtioBlk<H, P>) -> usize {
        let mut resolved = 0;
        while self.irq_pending.swap(false, Ordering::AcqRel) {
            resolved += dev.handle_interrupt();
        }
        resolved
    }

    fn admit(&self, request: BlockRequest, data: &[u8]) -> Result<RequestToken, BlockError> {
        let mut attempt = 0;
        loop {
            let (result, spins, retries) = {
                let mut dev = self.lock();
                let result = dev.submit(request, data);
                if matches!(result, Err(err) if err.is_transient()) {
                    dev.poll();
                }
                (result, dev.config().backoff_spins, dev.config().admission_retries)
            };
            match result {
                Err(err) if err.is_transient() && attempt < retries => {
                    self.lock().note_retry();
                    backoff(spins, attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn complete(&self, token: RequestToken, out: &mut [u8]) -> Result<usize, BlockError> {
        let budget = self.lock().config().poll_budget;
        for _ in 0..budget {
            {
                let mut dev = self.lock();
                dev.poll();
                if let Some(len) = dev.take_completion(token, out)? {
                    return Ok(len);
                }
            }
            core::hint::spin_loop();
        }
        Err(self.lock().expire(token))
    }

    pub fn read(&self, lba: u64, buf: &mut [u8]) -> Result<usize, BlockError> {
        let sector = self.lock().device_sector(lba)?;
        let token = self.admit(BlockRequest::read(sector, buf.len()), &[])?;
        self.complete(token, buf)
    }

    pub fn write(&self, lba: u64, data: &[u8]) -> Result<usize, BlockError> {
        let sector = self.lock().device_sector(lba)?;
        let token = self.admit(BlockRequest::write(sector, data.len()), data)?;
        self.complete(token, &mut [])
    }

    pub fn flush(&self) -> Result<(), BlockError> {
        let token = self.admit(BlockRequest::flush(), &[])?;
        self.complete(token, &mut []).map(|_| ())
    }

    pub fn get_capacity(&self) -> Result<u64, BlockError> {
        let token = self.admit(BlockRequest::get_size(), &[])?;
        let mut bytes = [0u8; GET_SIZE_LEN];
        self.complete(token, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn get_info(&self) -> Result<(u64, u32), BlockError> {
        self.lock().get_info()
    }

    /// Interrupt entry.
    ///
    /// `None` if another context holds the lock. The interrupt stays flagged
    /// and that holder acknowledges it before releasing the lock.
    pub fn handle_interrupt(&self) -> Option<usize> {
        self.irq_pending.store(true, Ordering::Release);
        let mut dev = self.try_lock()?;
        Some(self.service(&mut dev))
    }

    pub fn shutdown(&self) -> Result<(), BlockError> {
        self.lock().shutdown()
    }
}

impl<H: VirtioHal, P: RegisterPort> Deref for SharedGuard<'_, H, P> {
    type Target = VirtioBlk<H, P>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<H: VirtioHal, P: RegisterPort> DerefMut for SharedGuard<'_, H, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<H: VirtioHal, P: RegisterPort> Drop for SharedGuard<'_, H, P> {
    fn drop(&mut self) {
        // SAFETY: `guard` is taken exactly once, here, and never used again.
        let mut guard = unsafe { ManuallyDrop::take(&mut self.guard) };
        loop {
            self.shared.service(&mut guard);
            drop(guard);
            // Flag raised between the service and the unlock
            if !self.shared.irq_pending.load(Ordering::Acquire) {
                return;
            }
            match self.shared.inner.try_lock() {
                Some(next) => guard = next,
                // The new holder services it on its own release
                None => return,
            }
        }
    }
}

impl<H: VirtioHal, P: RegisterPort> core::fmt::Debug for SharedVirtioBlk<H, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.inner.try_lock() {
            Some(dev) => f.debug_tuple("SharedVirtioBlk").field(&*dev).finish(),
            None => f.write_str("SharedVirtioBlk(<locked>)"),
        }
    }
}
