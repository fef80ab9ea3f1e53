//! # Processor Idle States
//!
//! `_CST` hands the driver one package per processor; each entry carries a
//! generic-register descriptor naming the entry method, an ACPI state type
//! (1 through 3), a worst-case exit latency, and a power figure. Intel
//! encodes its native entry methods in the fixed-hardware address space:
//! the register bit offset selects HLT, port-read-then-HLT, or MWAIT, and
//! the MWAIT coordination flags ride in the access-size field. Registers
//! in any other address space are taken as port-read entries. Without
//! `_CST`, the legacy processor block still supplies C2 and C3 ports when
//! the FADT latencies qualify them.
//!
//! C2 and C3 stop bus snooping, so entry disables the bus arbiter (PM2)
//! and arms bus-master wake (PM1 control) first; C3 additionally demotes
//! to the deepest non-C3 state when a bus master has been active since the
//! last check.
//!
//! Idle states reach the scheduler in one batch: [`ProcessorTable`] counts
//! processor starts against the platform's declared processor count and
//! releases the registration exactly once, when the last processor is up.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use kernel_acpi_tables::fadt::Fadt;
use kernel_acpi_tables::header::{ADDRESS_SPACE_FIXED_HARDWARE, GenericAddress};
use log::{debug, warn};

use crate::fixedreg::{FixedRegister, FixedRegisters, PM2_ARBITER_DISABLE, Pm1Control, Pm1Event};
use crate::namespace::{AcpiValue, METHOD_CST, Namespace, NodeHandle, ProcessorDeclaration};
use crate::resdesc;
use crate::{AcpiError, SystemOps};

/// Upper bound on C-states kept per processor; firmware extras are
/// dropped.
pub const MAX_CSTATES: usize = 8;

/// ACPI C-state types.
const TYPE_C1: u8 = 1;
const TYPE_C2: u8 = 2;
const TYPE_C3: u8 = 3;

/// Fixed-hardware registers with this bit width carry Intel's native
/// entry encodings.
const VENDOR_INTEL: u8 = 0x01;

/// Intel entry encodings, selected by the register bit offset.
const NATIVE_HALT: u8 = 0x00;
const NATIVE_IO_HALT: u8 = 0x01;
const NATIVE_MWAIT: u8 = 0x02;

/// MWAIT flag bits, carried in the access-size field.
const MWAIT_HARDWARE_COORDINATED: u8 = 0x1;
const MWAIT_BUS_MASTER_AVOIDANCE: u8 = 0x2;

/// FADT latencies beyond these limits mark the legacy C2/C3 ports
/// unusable.
const C2_LATENCY_LIMIT: u16 = 100;
const C3_LATENCY_LIMIT: u16 = 1000;

/// The processor block starts with the 4-byte `P_CNT` register; the
/// `P_LVL2` and `P_LVL3` entry ports follow it byte by byte.
const BLOCK_LVL2_OFFSET: u32 = 4;
const BLOCK_LVL3_OFFSET: u32 = 5;
const BLOCK_LVL2_LENGTH: u8 = 5;
const BLOCK_LVL3_LENGTH: u8 = 6;

/// Entry method of a C-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CStateEntry {
    /// Native halt instruction.
    Halt,
    /// Port read followed by a halt.
    IoHalt { port: u16 },
    /// Port read; the chipset enters the state on the read.
    Io { port: u16 },
    /// Native monitor/mwait with a state hint.
    Mwait {
        hint: u32,
        /// Hardware coordinates the state across the package.
        hardware_coordinated: bool,
        /// Bus-master traffic is handled in hardware; entry skips the
        /// arbiter dance.
        bus_master_avoidance: bool,
    },
}

/// One C-state: how to enter it and what it costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CState {
    pub entry: CStateEntry,
    /// ACPI state type, 1 (C1) through 3 (C3).
    pub state_type: u8,
    /// Worst-case exit latency in microseconds.
    pub latency_us: u32,
    /// Average power in milliwatts, zero when unknown.
    pub power_mw: u32,
}

/// Decoded C-states of one processor, shallowest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CStateTable {
    pub states: Vec<CState>,
    /// Index into `states` of the deepest state that is not C3. Entry
    /// demotes to this state while bus masters are active.
    pub highest_non_c3: usize,
}

impl CStateTable {
    fn from_states(states: Vec<CState>) -> Option<Self> {
        if states.is_empty() {
            return None;
        }
        let highest_non_c3 = states
            .iter()
            .rposition(|state| state.state_type < TYPE_C3)
            .unwrap_or(0);
        Some(Self {
            states,
            highest_non_c3,
        })
    }
}

/// One idle state as handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleState {
    /// Display name, `C1` upward by table position.
    pub name: String,
    pub entry: CStateEntry,
    /// Worst-case exit latency in microseconds.
    pub exit_latency_us: u32,
    /// Minimum idle time for which entering is worthwhile.
    pub target_residency_us: u32,
    pub power_mw: u32,
}

/// Per-processor state carried on the device context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorContext {
    /// ACPI processor id from the `Processor` declaration.
    pub acpi_id: u32,
    /// Physical processor id the MADT maps the ACPI id to.
    pub physical_id: u32,
    /// Processor control block port, zero when absent.
    pub block_address: u32,
    /// Length of the control block in bytes.
    pub block_length: u8,
    /// Decoded C-states, when any were usable.
    pub cstates: Option<CStateTable>,
}

impl ProcessorContext {
    #[must_use]
    pub const fn new(declaration: ProcessorDeclaration, physical_id: u32) -> Self {
        Self {
            acpi_id: declaration.processor_id,
            physical_id,
            block_address: declaration.block_address,
            block_length: declaration.block_length,
            cstates: None,
        }
    }
}

/// Evaluates `_CST` below a processor node and decodes the package.
///
/// Returns `Ok(None)` when the method does not exist. Entries with vendor
/// encodings the driver does not understand are skipped rather than
/// failing the whole package; a package that yields no usable state is
/// also `Ok(None)`.
///
/// # Errors
/// [`AcpiError::UnexpectedType`] when the package shape is wrong,
/// [`AcpiError::MalformedDataStream`] when the declared count overruns the
/// package or a field does not fit, plus whatever the interpreter reports.
pub fn parse_cst(
    namespace: &dyn Namespace,
    processor: NodeHandle,
) -> Result<Option<CStateTable>, AcpiError> {
    let Some(value) = namespace.find_and_evaluate(processor, METHOD_CST, &[])? else {
        return Ok(None);
    };
    let package = value.as_package().ok_or(AcpiError::UnexpectedType)?;
    let [count, entries @ ..] = package else {
        return Err(AcpiError::MalformedDataStream);
    };
    let declared = count.as_integer().ok_or(AcpiError::UnexpectedType)?;
    let declared = usize::try_from(declared).map_err(|_| AcpiError::MalformedDataStream)?;
    if declared > entries.len() {
        return Err(AcpiError::MalformedDataStream);
    }
    if declared > MAX_CSTATES {
        warn!("_CST declares {declared} states; keeping the first {MAX_CSTATES}");
    }

    let mut states = Vec::new();
    for entry in entries.iter().take(declared.min(MAX_CSTATES)) {
        match parse_state(entry) {
            Ok(state) => states.push(state),
            Err(AcpiError::NotSupported) => {
                debug!("skipping a C-state with an unrecognized entry encoding");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(CStateTable::from_states(states))
}

fn parse_state(entry: &AcpiValue) -> Result<CState, AcpiError> {
    let fields = entry.as_package().ok_or(AcpiError::UnexpectedType)?;
    let [register, state_type, latency, power] = fields else {
        return Err(AcpiError::MalformedDataStream);
    };
    let descriptor = register.as_buffer().ok_or(AcpiError::UnexpectedType)?;
    let entry = decode_entry(resdesc::parse_generic_register(descriptor)?)?;
    let state_type = state_type.as_integer().ok_or(AcpiError::UnexpectedType)?;
    if !(u64::from(TYPE_C1)..=u64::from(TYPE_C3)).contains(&state_type) {
        return Err(AcpiError::NotSupported);
    }
    Ok(CState {
        entry,
        state_type: u8::try_from(state_type).map_err(|_| AcpiError::MalformedDataStream)?,
        latency_us: integer_field(latency)?,
        power_mw: integer_field(power)?,
    })
}

fn integer_field(value: &AcpiValue) -> Result<u32, AcpiError> {
    let value = value.as_integer().ok_or(AcpiError::UnexpectedType)?;
    u32::try_from(value).map_err(|_| AcpiError::MalformedDataStream)
}

fn decode_entry(register: GenericAddress) -> Result<CStateEntry, AcpiError> {
    if register.address_space_id != ADDRESS_SPACE_FIXED_HARDWARE {
        return Ok(CStateEntry::Io {
            port: port_of(register.address)?,
        });
    }
    if register.register_bit_width != VENDOR_INTEL {
        return Err(AcpiError::NotSupported);
    }
    match register.register_bit_offset {
        NATIVE_HALT => Ok(CStateEntry::Halt),
        NATIVE_IO_HALT => Ok(CStateEntry::IoHalt {
            port: port_of(register.address)?,
        }),
        NATIVE_MWAIT => Ok(CStateEntry::Mwait {
            hint: u32::try_from(register.address).map_err(|_| AcpiError::MalformedDataStream)?,
            hardware_coordinated: register.access_size & MWAIT_HARDWARE_COORDINATED != 0,
            bus_master_avoidance: register.access_size & MWAIT_BUS_MASTER_AVOIDANCE != 0,
        }),
        _ => Err(AcpiError::NotSupported),
    }
}

fn port_of(address: u64) -> Result<u16, AcpiError> {
    u16::try_from(address).map_err(|_| AcpiError::MalformedDataStream)
}

/// Builds a C-state table from the legacy processor block when `_CST` is
/// absent: C1 by halt, plus the `P_LVL2`/`P_LVL3` ports when the block
/// reaches them and the FADT latencies qualify them.
#[must_use]
pub fn fallback_table(fadt: &Fadt, block_address: u32, block_length: u8) -> Option<CStateTable> {
    let mut states = Vec::with_capacity(3);
    states.push(CState {
        entry: CStateEntry::Halt,
        state_type: TYPE_C1,
        latency_us: 0,
        power_mw: 0,
    });
    if block_address != 0 {
        if block_length >= BLOCK_LVL2_LENGTH
            && fadt.c2_latency <= C2_LATENCY_LIMIT
            && let Ok(port) = u16::try_from(block_address + BLOCK_LVL2_OFFSET)
        {
            states.push(CState {
                entry: CStateEntry::Io { port },
                state_type: TYPE_C2,
                latency_us: u32::from(fadt.c2_latency),
                power_mw: 0,
            });
        }
        if block_length >= BLOCK_LVL3_LENGTH
            && fadt.c3_latency <= C3_LATENCY_LIMIT
            && let Ok(port) = u16::try_from(block_address + BLOCK_LVL3_OFFSET)
        {
            states.push(CState {
                entry: CStateEntry::Io { port },
                state_type: TYPE_C3,
                latency_us: u32::from(fadt.c3_latency),
                power_mw: 0,
            });
        }
    }
    CStateTable::from_states(states)
}

/// Converts a table into the records the scheduler's idle loop consumes.
/// The worthwhile-residency target is twice the exit latency.
#[must_use]
pub fn idle_states(table: &CStateTable) -> Vec<IdleState> {
    table
        .states
        .iter()
        .enumerate()
        .map(|(index, state)| IdleState {
            name: format!("C{}", index + 1),
            entry: state.entry,
            exit_latency_us: state.latency_us,
            target_residency_us: state.latency_us.saturating_mul(2),
            power_mw: state.power_mw,
        })
        .collect()
}

/// C2 and C3 stop snooping while bus masters may still need memory;
/// MWAIT states that avoid bus masters in hardware skip the dance.
const fn needs_arbiter_dance(state: &CState) -> bool {
    if state.state_type < TYPE_C2 {
        return false;
    }
    !matches!(
        state.entry,
        CStateEntry::Mwait {
            bus_master_avoidance: true,
            ..
        }
    )
}

/// Performs the register work before the kernel executes a C-state's
/// entry method and returns the index of the state actually to enter.
///
/// C3 demotes to the deepest non-C3 state when a bus master has been
/// active since the last check; the sticky status bit is cleared either
/// way. The state finally chosen disables the bus arbiter and arms
/// bus-master wake when its type requires it; platforms without a PM2
/// block skip the arbiter half.
///
/// # Errors
/// [`AcpiError::InvalidParameter`] when `index` is out of range, plus
/// register access errors from [`FixedRegisters`].
pub fn enter_state(
    system: &dyn SystemOps,
    registers: &FixedRegisters,
    table: &CStateTable,
    index: usize,
) -> Result<usize, AcpiError> {
    if index >= table.states.len() {
        return Err(AcpiError::InvalidParameter);
    }
    let mut index = index;
    if table.states[index].state_type == TYPE_C3 {
        let bus_master = u32::from(Pm1Event::new().with_bus_master(true).into_bits());
        let status = registers.read(system, FixedRegister::Pm1Status)?;
        if status & bus_master != 0 {
            // Status bits clear on writing one back.
            registers.write(system, FixedRegister::Pm1Status, bus_master)?;
            index = table.highest_non_c3;
        }
    }
    if needs_arbiter_dance(&table.states[index]) {
        match registers.write(system, FixedRegister::Pm2Control, PM2_ARBITER_DISABLE) {
            Ok(()) | Err(AcpiError::NotSupported) => {}
            Err(error) => return Err(error),
        }
        let wake = u32::from(Pm1Control::new().with_bus_master_wake(true).into_bits());
        let control = registers.read(system, FixedRegister::Pm1Control)?;
        registers.write(system, FixedRegister::Pm1Control, control | wake)?;
    }
    Ok(index)
}

/// Undoes the register work of [`enter_state`] after wake-up.
///
/// # Errors
/// [`AcpiError::InvalidParameter`] when `index` is out of range, plus
/// register access errors from [`FixedRegisters`].
pub fn leave_state(
    system: &dyn SystemOps,
    registers: &FixedRegisters,
    table: &CStateTable,
    index: usize,
) -> Result<(), AcpiError> {
    if index >= table.states.len() {
        return Err(AcpiError::InvalidParameter);
    }
    if !needs_arbiter_dance(&table.states[index]) {
        return Ok(());
    }
    let wake = u32::from(Pm1Control::new().with_bus_master_wake(true).into_bits());
    let control = registers.read(system, FixedRegister::Pm1Control)?;
    registers.write(system, FixedRegister::Pm1Control, control & !wake)?;
    match registers.write(system, FixedRegister::Pm2Control, 0) {
        Ok(()) | Err(AcpiError::NotSupported) => Ok(()),
        Err(error) => Err(error),
    }
}

/// Counts processor starts against the platform's declared processor
/// count and releases the idle-state registration exactly once.
///
/// C-state tables are taken as uniform across the package: the first
/// table reported wins and later ones are ignored.
pub struct ProcessorTable {
    declared: usize,
    started: usize,
    registered: bool,
    table: Option<CStateTable>,
}

impl ProcessorTable {
    /// `declared` is the enabled-processor count from the MADT.
    #[must_use]
    pub const fn new(declared: usize) -> Self {
        Self {
            declared,
            started: 0,
            registered: false,
            table: None,
        }
    }

    /// Number of processors that have completed start.
    #[must_use]
    pub const fn started(&self) -> usize {
        self.started
    }

    /// Records a started processor. Returns the idle states to hand to
    /// the scheduler when this was the last declared processor; `None`
    /// before that, after registration already fired, or when no
    /// processor brought a usable C-state table.
    pub fn processor_started(&mut self, table: Option<&CStateTable>) -> Option<Vec<IdleState>> {
        if self.table.is_none() {
            self.table = table.cloned();
        }
        self.started += 1;
        if self.registered || self.started < self.declared {
            return None;
        }
        self.registered = true;
        self.table.as_ref().map(idle_states)
    }
}
