//! # Sleep States and Reset
//!
//! Entering a sleep state is a firmware dialogue followed by a single
//! register write. The dialogue (`\_TTS`, then `\_PTS`, both with the
//! target state) runs while the machine is still fully alive and may
//! execute arbitrary AML; the write puts the sleep type and the enable
//! bit into PM1 control, and for anything deeper than S0 the processor
//! does not come back from it. The `_Sx` packages are decoded once at
//! driver init so the transition path never touches the interpreter for
//! data.
//!
//! Reset goes through the FADT reset register when the table declares
//! one. A machine that survives the write reports a timeout.

use log::warn;

use kernel_acpi_tables::fadt::Fadt;

use crate::fixedreg::{self, FixedRegister, FixedRegisters, Pm1Control, Pm1Event};
use crate::namespace::{AcpiValue, METHOD_PTS, METHOD_TTS, Namespace, NodeHandle, sleep_state_name};
use crate::{AcpiError, SystemOps};

/// Sleep states S0 through S5.
const SLEEP_STATE_COUNT: usize = 6;
const MAX_SLEEP_STATE: u8 = 5;

/// SLP_TYP occupies three bits of PM1 control.
const SLEEP_TYPE_MASK: u8 = 0b111;

/// Grace period after a reset write before declaring it dead.
const RESET_SETTLE_MS: u64 = 100;

/// Sleep methods and per-state sleep values, discovered once at init.
pub struct SleepSupport {
    /// `\_TTS`, notified at every transition edge.
    tts: Option<NodeHandle>,
    /// `\_PTS`, notified before entering any sleep state.
    pts: Option<NodeHandle>,
    /// Decoded SLP_TYP per sleep state, `_S0_` through `_S5_`.
    sleep_values: [Option<u8>; SLEEP_STATE_COUNT],
}

impl SleepSupport {
    /// Whether the firmware declared a sleep value for `state`.
    #[must_use]
    pub fn supports(&self, state: u8) -> bool {
        self.sleep_value(state).is_some()
    }

    /// The SLP_TYP value of `state`, when declared.
    #[must_use]
    pub fn sleep_value(&self, state: u8) -> Option<u8> {
        self.sleep_values.get(usize::from(state)).copied().flatten()
    }
}

/// Finds `\_TTS` and `\_PTS` and decodes each `\_Sx` package.
///
/// Malformed `_Sx` packages are dropped with a warning; their states
/// simply stay unsupported.
///
/// # Errors
/// Evaluation errors from the interpreter pass through.
pub fn discover(namespace: &dyn Namespace) -> Result<SleepSupport, AcpiError> {
    let root = namespace.root();
    let mut sleep_values = [None; SLEEP_STATE_COUNT];
    for state in 0..=MAX_SLEEP_STATE {
        let name = sleep_state_name(state);
        if let Some(value) = namespace.find_and_evaluate(root, name, &[])? {
            match decode_sleep_value(&value) {
                Ok(decoded) => sleep_values[usize::from(state)] = Some(decoded),
                Err(_) => warn!("ignoring a malformed _S{state}_ package"),
            }
        }
    }
    Ok(SleepSupport {
        tts: namespace.find_child(root, METHOD_TTS),
        pts: namespace.find_child(root, METHOD_PTS),
        sleep_values,
    })
}

/// The package carries the PM1a and PM1b sleep values in its first two
/// elements; writes mirror one value to both blocks, so the halves are
/// folded together.
fn decode_sleep_value(value: &AcpiValue) -> Result<u8, AcpiError> {
    let package = value.as_package().ok_or(AcpiError::UnexpectedType)?;
    let first = package
        .first()
        .and_then(AcpiValue::as_integer)
        .ok_or(AcpiError::UnexpectedType)?;
    let second = package.get(1).and_then(AcpiValue::as_integer).unwrap_or(0);
    u8::try_from((first | second) & u64::from(SLEEP_TYPE_MASK))
        .map_err(|_| AcpiError::MalformedDataStream)
}

/// Runs the firmware notification half of a sleep transition: `\_TTS`
/// then `\_PTS`, each with the target state. Must run at low runlevel;
/// an AML failure aborts the transition with its error.
///
/// # Errors
/// [`AcpiError::InvalidParameter`] for a state beyond S5; evaluation
/// errors pass through.
pub fn prepare_system_state_transition(
    namespace: &dyn Namespace,
    support: &SleepSupport,
    state: u8,
) -> Result<(), AcpiError> {
    if state > MAX_SLEEP_STATE {
        return Err(AcpiError::InvalidParameter);
    }
    let argument = [AcpiValue::Integer(u64::from(state))];
    if let Some(tts) = support.tts {
        namespace.evaluate(tts, &argument)?;
    }
    if let Some(pts) = support.pts {
        namespace.evaluate(pts, &argument)?;
    }
    Ok(())
}

/// Writes the sleep vector: clears the sticky wake status so this sleep
/// is distinguishable from the last one, then replaces the sleep type
/// and sets the enable bit in one PM1 control write, preserving the
/// other control bits. For S1 through S5 the processor stops inside the
/// write; returning at all means S0 or a wake already in flight.
///
/// # Errors
/// [`AcpiError::InvalidParameter`] for a state beyond S5,
/// [`AcpiError::NotSupported`] when the firmware declared no sleep value
/// for it; register access errors from [`FixedRegisters`].
pub fn perform_system_state_transition(
    system: &dyn SystemOps,
    registers: &FixedRegisters,
    support: &SleepSupport,
    state: u8,
) -> Result<(), AcpiError> {
    if state > MAX_SLEEP_STATE {
        return Err(AcpiError::InvalidParameter);
    }
    let value = support.sleep_value(state).ok_or(AcpiError::NotSupported)?;

    let wake = u32::from(Pm1Event::new().with_wake(true).into_bits());
    registers.write(system, FixedRegister::Pm1Status, wake)?;

    let mask = u32::from(
        Pm1Control::new()
            .with_sleep_type(SLEEP_TYPE_MASK)
            .with_sleep_enable(true)
            .into_bits(),
    );
    let vector = u32::from(
        Pm1Control::new()
            .with_sleep_type(value)
            .with_sleep_enable(true)
            .into_bits(),
    );
    let control = registers.read(system, FixedRegister::Pm1Control)?;
    registers.write(system, FixedRegister::Pm1Control, (control & !mask) | vector)
}

/// Resets the platform through the FADT reset register.
///
/// Does not return when the reset takes. The settle delay covers the
/// propagation time of slow reset logic.
///
/// # Errors
/// [`AcpiError::NotSupported`] when the FADT declares no usable reset
/// register; [`AcpiError::Timeout`] when the system survived the write;
/// register access errors from [`fixedreg::write_register`].
pub fn reset(system: &dyn SystemOps, fadt: &Fadt) -> Result<(), AcpiError> {
    let register = fadt.reset_register;
    if !fadt.reset_register_usable() || !register.is_implemented() {
        return Err(AcpiError::NotSupported);
    }
    fixedreg::write_register(system, register, u32::from(fadt.reset_value))?;
    system.delay_ms(RESET_SETTLE_MS);
    Err(AcpiError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use kernel_acpi_tables::header::GenericAddress;

    use crate::testing::{ScriptedNamespace, TestSystem, fadt_with};

    fn sleep_package(first: u64, second: u64) -> AcpiValue {
        AcpiValue::Package(vec![
            AcpiValue::Integer(first),
            AcpiValue::Integer(second),
        ])
    }

    fn support_with(values: [Option<u8>; SLEEP_STATE_COUNT]) -> SleepSupport {
        SleepSupport {
            tts: None,
            pts: None,
            sleep_values: values,
        }
    }

    fn pm_registers() -> FixedRegisters {
        FixedRegisters::from_fadt(&fadt_with(|fadt| {
            fadt.pm1a_event_block = 0x400;
            fadt.pm1_event_length = 4;
            fadt.pm1a_control_block = 0x404;
            fadt.pm1b_control_block = 0x408;
            fadt.pm1_control_length = 2;
        }))
    }

    #[test]
    fn sleep_packages_decode_once_at_init() {
        let mut namespace = ScriptedNamespace::new();
        let root = namespace.root();
        namespace.add_method(root, *b"_S0_", Ok(sleep_package(0, 0)));
        // The halves are folded together.
        namespace.add_method(root, *b"_S3_", Ok(sleep_package(1, 4)));
        namespace.add_method(root, *b"_S5_", Ok(sleep_package(7, 7)));
        // A bare integer is not a package; the state stays unsupported.
        namespace.add_method(root, *b"_S4_", Ok(AcpiValue::Integer(6)));

        let support = discover(&namespace).unwrap();
        assert!(support.supports(0));
        assert!(support.supports(3));
        assert!(support.supports(5));
        assert!(!support.supports(1));
        assert!(!support.supports(4));
        assert_eq!(support.sleep_value(3), Some(5));
        assert_eq!(support.sleep_value(5), Some(7));
    }

    #[test]
    fn prepare_runs_tts_then_pts_with_the_state() {
        let mut namespace = ScriptedNamespace::new();
        let root = namespace.root();
        let tts = namespace.add_method(root, METHOD_TTS, Ok(AcpiValue::Integer(0)));
        let pts = namespace.add_method(root, METHOD_PTS, Ok(AcpiValue::Integer(0)));
        let support = discover(&namespace).unwrap();

        prepare_system_state_transition(&namespace, &support, 5).unwrap();
        assert_eq!(
            *namespace.evaluations.lock(),
            [
                (tts, vec![AcpiValue::Integer(5)]),
                (pts, vec![AcpiValue::Integer(5)]),
            ]
        );
    }

    #[test]
    fn failing_pts_aborts_the_transition() {
        let mut namespace = ScriptedNamespace::new();
        let root = namespace.root();
        namespace.add_method(root, METHOD_PTS, Err(AcpiError::InvalidConfiguration));
        let support = discover(&namespace).unwrap();

        assert_eq!(
            prepare_system_state_transition(&namespace, &support, 3),
            Err(AcpiError::InvalidConfiguration)
        );
    }

    #[test]
    fn absent_methods_make_prepare_a_no_op() {
        let namespace = ScriptedNamespace::new();
        let support = discover(&namespace).unwrap();

        prepare_system_state_transition(&namespace, &support, 5).unwrap();
        assert!(namespace.evaluations.lock().is_empty());
    }

    #[test]
    fn the_sleep_write_sets_type_and_enable_in_one_shot() {
        let system = TestSystem::new();
        let registers = pm_registers();
        let mut values = [None; SLEEP_STATE_COUNT];
        values[5] = Some(5);
        let support = support_with(values);
        // ACPI mode bit and a stale sleep type survive from earlier.
        system.set_port(0x404, 0x0C01);

        perform_system_state_transition(&system, &registers, &support, 5).unwrap();
        // Wake status cleared first, then the vector mirrored to both
        // control blocks with SCI_EN preserved and the stale type gone.
        assert_eq!(
            *system.port_writes.lock(),
            [(0x400, 0x8000), (0x404, 0x3401), (0x408, 0x3401)]
        );
    }

    #[test]
    fn unsupported_states_do_not_write() {
        let system = TestSystem::new();
        let registers = pm_registers();
        let support = support_with([None; SLEEP_STATE_COUNT]);

        assert_eq!(
            perform_system_state_transition(&system, &registers, &support, 1),
            Err(AcpiError::NotSupported)
        );
        assert_eq!(
            perform_system_state_transition(&system, &registers, &support, 9),
            Err(AcpiError::InvalidParameter)
        );
        assert!(system.port_writes.lock().is_empty());
    }

    #[test]
    fn reset_goes_through_the_fadt_register() {
        let system = TestSystem::new();
        let fadt = fadt_with(|fadt| {
            fadt.reset_register = GenericAddress::io(0xCF9, 1);
            fadt.reset_value = 6;
        });

        // The machine is still here, so the reset reports a timeout.
        assert_eq!(reset(&system, &fadt), Err(AcpiError::Timeout));
        assert_eq!(*system.port_writes.lock(), [(0xCF9, 0x6)]);
        assert!(system.time_ticks() >= RESET_SETTLE_MS);
    }

    #[test]
    fn reset_without_a_usable_register_is_not_supported() {
        let system = TestSystem::new();
        let fadt = fadt_with(|_| {});

        assert_eq!(reset(&system, &fadt), Err(AcpiError::NotSupported));
        assert!(system.port_writes.lock().is_empty());
    }
}
