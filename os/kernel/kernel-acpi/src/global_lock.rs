//! # ACPI Global Lock
//!
//! The FACS carries a lock word shared with the firmware: bit 1 marks the
//! word owned, bit 0 records that the other party wants it next. Ownership
//! changes hands through compare-exchange only. When a release finds the
//! pending bit set, the kernel tells the firmware by setting `GBL_RLS` in
//! PM1 control.
//!
//! A ticket lock serializes kernel callers first, so at most one processor
//! negotiates with the firmware at a time and waiters are served in
//! arrival order.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use kernel_acpi_tables::facs::{Facs, GLOBAL_LOCK_OFFSET, GLOBAL_LOCK_OWNED, GLOBAL_LOCK_PENDING};
use kernel_acpi_tables::fadt::Fadt;
use kernel_sync::{MutexGuard, RawTicket, TicketMutex};
use log::warn;

use crate::fixedreg::{FixedRegister, FixedRegisters, Pm1Control};
use crate::{AcpiError, SystemOps};

/// The FACS occupies 64 bytes regardless of revision.
const FACS_LENGTH: usize = 64;

/// Waiting longer than this means the firmware half is wedged. There is
/// no way to revoke a shared lock from a dead owner, so the system stops.
const ACQUIRE_TIMEOUT_SECONDS: u64 = 60;

/// Pointer to the lock word inside the permanently mapped FACS.
struct LockWord(NonNull<u32>);

// The word is only ever accessed through `AtomicU32::from_ptr`.
unsafe impl Send for LockWord {}
unsafe impl Sync for LockWord {}

/// The firmware-shared global lock.
pub struct GlobalLock {
    queue: TicketMutex<()>,
    word: Option<LockWord>,
}

impl GlobalLock {
    /// A lock with no firmware half: acquisition only serializes kernel
    /// callers. Used when the FACS is absent or the platform runs in
    /// hardware-reduced mode.
    #[must_use]
    pub const fn software_only() -> Self {
        Self {
            queue: TicketMutex::new(()),
            word: None,
        }
    }

    /// Locates the lock word inside the FACS named by the FADT.
    ///
    /// # Errors
    /// [`AcpiError::InsufficientResources`] when the FACS cannot be
    /// mapped, [`AcpiError::Table`] when the mapped bytes are not a FACS.
    pub fn from_fadt(system: &dyn SystemOps, fadt: &Fadt) -> Result<Self, AcpiError> {
        let address = fadt.facs_address();
        if address == 0 || fadt.hardware_reduced() {
            return Ok(Self::software_only());
        }
        let base = system
            .map_physical(address, FACS_LENGTH)
            .ok_or(AcpiError::InsufficientResources)?;
        let bytes = unsafe { core::slice::from_raw_parts(base.as_ptr(), FACS_LENGTH) };
        Facs::parse(bytes)?;
        let word = unsafe { base.as_ptr().add(GLOBAL_LOCK_OFFSET) }.cast::<u32>();
        Ok(Self {
            queue: TicketMutex::new(()),
            word: NonNull::new(word).map(LockWord),
        })
    }

    /// Acquires the lock, waiting for the firmware to hand it over while
    /// it is owned. Fatal after [`ACQUIRE_TIMEOUT_SECONDS`].
    pub fn acquire<'lock>(
        &'lock self,
        system: &'lock dyn SystemOps,
        registers: &'lock FixedRegisters,
    ) -> GlobalLockGuard<'lock> {
        let ticket = self.queue.lock();
        if let Some(word) = &self.word {
            let word = unsafe { AtomicU32::from_ptr(word.0.as_ptr()) };
            wait_for_ownership(system, word);
        }
        GlobalLockGuard {
            lock: self,
            system,
            registers,
            _ticket: ticket,
        }
    }
}

/// One compare-exchange pass over the lock word. Returns whether this
/// caller owns the word afterwards; otherwise the pending bit has been
/// set and the firmware will hand the lock over on its release.
fn try_acquire(word: &AtomicU32) -> bool {
    loop {
        let current = word.load(Ordering::Relaxed);
        let mut next = (current | GLOBAL_LOCK_OWNED) & !GLOBAL_LOCK_PENDING;
        if current & GLOBAL_LOCK_OWNED != 0 {
            next |= GLOBAL_LOCK_PENDING;
        }
        if word
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return next & GLOBAL_LOCK_PENDING == 0;
        }
    }
}

/// Clears ownership. Returns whether the firmware was waiting.
fn release(word: &AtomicU32) -> bool {
    loop {
        let current = word.load(Ordering::Relaxed);
        let next = current & !(GLOBAL_LOCK_OWNED | GLOBAL_LOCK_PENDING);
        if word
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return current & GLOBAL_LOCK_PENDING != 0;
        }
    }
}

fn wait_for_ownership(system: &dyn SystemOps, word: &AtomicU32) {
    let deadline = system.time_ticks() + ACQUIRE_TIMEOUT_SECONDS * system.ticks_per_second();
    while !try_acquire(word) {
        if system.time_ticks() >= deadline {
            system.fatal(
                "global lock held past the acquisition timeout",
                u64::from(word.load(Ordering::Relaxed)),
            );
        }
        system.delay_ms(1);
    }
}

/// Holds the global lock; dropping releases it and, when the firmware is
/// waiting, signals `GBL_RLS`.
pub struct GlobalLockGuard<'lock> {
    lock: &'lock GlobalLock,
    system: &'lock dyn SystemOps,
    registers: &'lock FixedRegisters,
    _ticket: MutexGuard<'lock, (), RawTicket>,
}

impl GlobalLockGuard<'_> {
    /// `GBL_RLS` tells the firmware its pending request can proceed.
    fn signal_firmware(&self) {
        let released = u32::from(Pm1Control::new().with_global_lock_released(true).into_bits());
        let result = self
            .registers
            .read(self.system, FixedRegister::Pm1Control)
            .and_then(|value| {
                self.registers
                    .write(self.system, FixedRegister::Pm1Control, value | released)
            });
        if let Err(error) = result {
            warn!("global lock release could not signal the firmware: {error}");
        }
    }
}

impl Drop for GlobalLockGuard<'_> {
    fn drop(&mut self) {
        let Some(word) = &self.lock.word else {
            return;
        };
        let word = unsafe { AtomicU32::from_ptr(word.0.as_ptr()) };
        if release(word) {
            self.signal_firmware();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestSystem, fadt_with};
    use kernel_acpi_tables::TableError;
    use kernel_acpi_tables::facs::FACS_SIGNATURE;

    const FACS_ADDRESS: u64 = 0x8_0000;

    fn seed_facs(system: &TestSystem, lock_word: u32) {
        let mut bytes = [0_u8; FACS_LENGTH];
        bytes[..4].copy_from_slice(&FACS_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&64_u32.to_le_bytes());
        bytes[GLOBAL_LOCK_OFFSET..GLOBAL_LOCK_OFFSET + 4]
            .copy_from_slice(&lock_word.to_le_bytes());
        system.write_physical(FACS_ADDRESS, &bytes);
    }

    fn lock_word(system: &TestSystem) -> u32 {
        let address = FACS_ADDRESS + u64::try_from(GLOBAL_LOCK_OFFSET).unwrap();
        u32::from_le_bytes(system.read_physical(address, 4).try_into().unwrap())
    }

    fn facs_fadt() -> kernel_acpi_tables::fadt::Fadt {
        fadt_with(|fadt| {
            fadt.x_firmware_control = FACS_ADDRESS;
            fadt.pm1a_control_block = 0x404;
            fadt.pm1_control_length = 2;
        })
    }

    #[test]
    fn missing_facs_degenerates_to_a_kernel_lock() {
        let system = TestSystem::new();
        system.fail_mappings(true);
        let fadt = fadt_with(|_| {});
        let registers = FixedRegisters::from_fadt(&fadt);

        let lock = GlobalLock::from_fadt(&system, &fadt).unwrap();
        drop(lock.acquire(&system, &registers));
        assert!(system.port_writes.lock().is_empty());
    }

    #[test]
    fn hardware_reduced_platforms_skip_the_firmware_half() {
        let system = TestSystem::new();
        system.fail_mappings(true);
        let fadt = fadt_with(|fadt| {
            fadt.x_firmware_control = FACS_ADDRESS;
            fadt.flags = kernel_acpi_tables::fadt::FADT_FLAG_HARDWARE_REDUCED_ACPI;
        });
        assert!(GlobalLock::from_fadt(&system, &fadt).is_ok());
    }

    #[test]
    fn garbage_at_the_facs_address_is_rejected() {
        let system = TestSystem::new();
        let fadt = facs_fadt();
        assert_eq!(
            GlobalLock::from_fadt(&system, &fadt).err(),
            Some(AcpiError::Table(TableError::BadSignature))
        );
    }

    #[test]
    fn acquire_owns_the_word_and_release_clears_it() {
        let system = TestSystem::new();
        let fadt = facs_fadt();
        let registers = FixedRegisters::from_fadt(&fadt);
        seed_facs(&system, 0);

        let lock = GlobalLock::from_fadt(&system, &fadt).unwrap();
        let guard = lock.acquire(&system, &registers);
        assert_eq!(lock_word(&system), GLOBAL_LOCK_OWNED);

        drop(guard);
        assert_eq!(lock_word(&system), 0);
        assert!(system.port_writes.lock().is_empty());
    }

    #[test]
    fn release_with_a_pending_waiter_signals_the_firmware() {
        let system = TestSystem::new();
        let fadt = facs_fadt();
        let registers = FixedRegisters::from_fadt(&fadt);
        seed_facs(&system, 0);

        let lock = GlobalLock::from_fadt(&system, &fadt).unwrap();
        let guard = lock.acquire(&system, &registers);

        // The firmware queues itself behind the kernel's ownership.
        let address = FACS_ADDRESS + u64::try_from(GLOBAL_LOCK_OFFSET).unwrap();
        system.write_physical(
            address,
            &(GLOBAL_LOCK_OWNED | GLOBAL_LOCK_PENDING).to_le_bytes(),
        );

        drop(guard);
        assert_eq!(lock_word(&system), 0);
        assert_eq!(system.port_writes.lock().as_slice(), &[(0x404, 0x4)]);
    }

    #[test]
    fn back_to_back_acquisitions_succeed() {
        let system = TestSystem::new();
        let fadt = facs_fadt();
        let registers = FixedRegisters::from_fadt(&fadt);
        seed_facs(&system, 0);

        let lock = GlobalLock::from_fadt(&system, &fadt).unwrap();
        drop(lock.acquire(&system, &registers));
        drop(lock.acquire(&system, &registers));
        assert_eq!(lock_word(&system), 0);
    }

    #[test]
    #[should_panic(expected = "global lock held past the acquisition timeout")]
    fn wedged_firmware_ownership_is_fatal() {
        let system = TestSystem::new();
        let fadt = facs_fadt();
        let registers = FixedRegisters::from_fadt(&fadt);
        seed_facs(&system, GLOBAL_LOCK_OWNED);

        let lock = GlobalLock::from_fadt(&system, &fadt).unwrap();
        let _guard = lock.acquire(&system, &registers);
    }
}
