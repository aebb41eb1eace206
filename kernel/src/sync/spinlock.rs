//! IRQ-saving ticket spinlock.
//!
//! The descriptor pool, PCD table and per-CPU slot array are all touched
//! from interrupt context (the page-fault handler reads PCD; the APIC
//! bring-up path touches CPU slots from the BSP while an AP is running).
//! A lock that only disables interrupts on the local CPU still lets a
//! remote CPU spin into the critical section, so fairness comes from the
//! ticket counters; interrupt-safety on top of that comes from masking
//! IRQs for the lock's lifetime on the CPU holding it.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use x86_64::instructions::interrupts;

pub struct IrqSpinlock<T: ?Sized> {
    next_ticket: AtomicUsize,
    now_serving: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for IrqSpinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for IrqSpinlock<T> {}

pub struct IrqSpinlockGuard<'a, T: ?Sized + 'a> {
    lock: &'a IrqSpinlock<T>,
    irqs_were_enabled: bool,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            now_serving: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> IrqSpinlock<T> {
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let irqs_were_enabled = interrupts::are_enabled();
        if irqs_were_enabled {
            interrupts::disable();
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }

        IrqSpinlockGuard {
            lock: self,
            irqs_were_enabled,
        }
    }

    /// Non-blocking attempt. Returns `None` if another ticket is currently
    /// being served.
    pub fn try_lock(&self) -> Option<IrqSpinlockGuard<'_, T>> {
        let irqs_were_enabled = interrupts::are_enabled();
        if irqs_were_enabled {
            interrupts::disable();
        }

        let ticket = self
            .next_ticket
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                if self.now_serving.load(Ordering::Acquire) == cur {
                    Some(cur + 1)
                } else {
                    None
                }
            });

        match ticket {
            Ok(_) => Some(IrqSpinlockGuard {
                lock: self,
                irqs_were_enabled,
            }),
            Err(_) => {
                if irqs_were_enabled {
                    interrupts::enable();
                }
                None
            }
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for IrqSpinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IrqSpinlock {{ next_ticket: {}, now_serving: {} }}",
            self.next_ticket.load(Ordering::Relaxed),
            self.now_serving.load(Ordering::Relaxed)
        )
    }
}

impl<T: ?Sized + Default> Default for IrqSpinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<'a, T: ?Sized> Deref for IrqSpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard means our ticket is the one `now_serving`
        // names, so we have exclusive access to `data` until drop.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for IrqSpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see Deref.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for IrqSpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        if self.irqs_were_enabled {
            interrupts::enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn single_threaded_lock_unlock() {
        let lock = IrqSpinlock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test_case]
    fn try_lock_contention() {
        let lock = IrqSpinlock::new(());
        let first = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(first);
        assert!(lock.try_lock().is_some());
    }
}
