//! # Kernel synchronization primitives
//!
//! Lock types shared by the boot path and the platform driver.
//!
//! [`SpinMutex`] is an unfair test-and-test-and-set lock for short critical
//! sections such as hardware register pairs. [`TicketMutex`] grants the lock
//! in strict arrival order and backs the device-tree and arbiter locks, where
//! starving a waiter would stall enumeration. [`SyncOnceCell`] holds
//! write-once singletons like the platform instance.
//!
//! The raw acquire/release protocols live behind the [`RawLock`] and
//! [`RawUnlock`] traits so that [`Mutex`] can wrap either protocol with the
//! same RAII guard.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;
mod raw_ticket;
mod sync_once_cell;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use sync_once_cell::SyncOnceCell;

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    unsafe fn raw_unlock(&self);
}
