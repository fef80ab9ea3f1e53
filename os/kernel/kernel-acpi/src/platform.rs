//! # Platform Driver Core
//!
//! One [`Platform`] value carries everything the driver holds at run
//! time: the parsed firmware tables, the fixed-register cache, the
//! global lock, the decoded sleep support, the device contexts with
//! their dependency edges, and the processor start gate. The kernel
//! creates it once during platform bring-up and drives enumeration
//! through it; there is no global state.
//!
//! Enumeration is a dialogue. [`Platform::attach_root`] anchors the
//! context tree at `\_SB`; [`Platform::query_children`] publishes the
//! namespace children of a bus as OS devices; the kernel then walks the
//! usual query-resources / start cycle per device, and each started bus
//! is queried for children in turn. On a bus that another driver
//! already enumerated (PCI, typically), this driver attaches as a
//! filter to the devices it can match by `_ADR` instead of creating
//! duplicates.

use alloc::vec::Vec;

use kernel_acpi_tables::fadt::Fadt;
use kernel_acpi_tables::madt::MadtView;
use kernel_sync::SpinMutex;
use log::{debug, info, warn};

use crate::cstates::{self, ProcessorContext, ProcessorTable};
use crate::device::{
    self, ContextId, DeviceContext, DeviceOps, DeviceStore, OsDevice, Role, STA_ENABLED,
};
use crate::fixedreg::FixedRegisters;
use crate::global_lock::{GlobalLock, GlobalLockGuard};
use crate::mode;
use crate::namespace::{
    AcpiValue, METHOD_CRS, METHOD_PRS, METHOD_PRT, METHOD_SRS, Namespace, NodeHandle, ObjectType,
};
use crate::requirements::{Allocation, Configuration, ResourceType, boot_allocations};
use crate::resdesc::{self, ProviderLookup};
use crate::routing::{self, InterruptRoute, PciRoutingTable};
use crate::sleep::{self, SleepSupport};
use crate::{AcpiError, SystemOps};

/// A device's resource picture as reported to the OS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceResources {
    /// Acceptable configurations, from `_PRS` when the device is
    /// reconfigurable, otherwise from `_CRS`.
    pub configurations: Vec<Configuration>,
    /// What the firmware already assigned, surfaced only while `_STA`
    /// reports the device enabled.
    pub boot: Vec<Allocation>,
}

/// The ACPI platform driver core.
pub struct Platform<'driver> {
    namespace: &'driver dyn Namespace,
    system: &'driver dyn SystemOps,
    devices: &'driver dyn DeviceOps,
    fadt: Fadt,
    madt: Option<MadtView<'driver>>,
    registers: FixedRegisters,
    global_lock: GlobalLock,
    sleep: SleepSupport,
    store: SpinMutex<DeviceStore>,
    /// Fences early PCI config-space consumers while `_PRT` runs; the
    /// one lock that is deliberately held across an evaluation.
    pci_lock: SpinMutex<()>,
    processors: SpinMutex<ProcessorTable>,
}

impl<'driver> Platform<'driver> {
    /// Brings the driver core up from the parsed firmware tables.
    ///
    /// Locates the fixed hardware registers, maps the FACS for the
    /// global lock, decodes the `\_Sx` sleep packages, and sizes the
    /// idle-state gate from the MADT's enabled processor count. Nothing
    /// is enumerated yet.
    ///
    /// # Errors
    /// [`AcpiError::InsufficientResources`] when the FACS cannot be
    /// mapped; evaluation errors from the sleep package walk pass
    /// through.
    pub fn new(
        namespace: &'driver dyn Namespace,
        system: &'driver dyn SystemOps,
        devices: &'driver dyn DeviceOps,
        fadt: &Fadt,
        madt: Option<MadtView<'driver>>,
    ) -> Result<Self, AcpiError> {
        let registers = FixedRegisters::from_fadt(fadt);
        let global_lock = GlobalLock::from_fadt(system, fadt)?;
        let sleep = sleep::discover(namespace)?;
        let declared = madt
            .map_or(1, |view| view.enabled_processor_count())
            .max(1);
        debug!("platform core up, {declared} processors declared");
        Ok(Self {
            namespace,
            system,
            devices,
            fadt: *fadt,
            madt,
            registers,
            global_lock,
            sleep,
            store: SpinMutex::new(DeviceStore::new()),
            pci_lock: SpinMutex::new(()),
            processors: SpinMutex::new(ProcessorTable::new(declared)),
        })
    }

    /// Anchors the context tree: `os_device` stands for `\_SB` and
    /// parents everything enumerated from here.
    pub fn attach_root(&self, os_device: OsDevice) {
        let bus = self.namespace.system_bus();
        self.store
            .lock()
            .insert(DeviceContext::new(bus, os_device, None, Role::BusDriver));
    }

    /// Publishes the namespace children of `bus` as OS devices.
    ///
    /// Only `Device` and `Processor` nodes are enumerable. When the bus
    /// reported no children of its own, this driver is the bus driver
    /// and creates a device per child from its hardware id; a child
    /// without one is skipped, not an error. When the bus did report
    /// children, the driver attaches as a filter instead, matching
    /// namespace nodes to reported devices by `_ADR` and leaving
    /// unmatched nodes alone. Either way the call is idempotent:
    /// already-attached children are returned as they are.
    ///
    /// # Errors
    /// [`AcpiError::NoSuchDevice`] when `bus` is not attached;
    /// evaluation and device-creation errors pass through.
    pub fn query_children(&self, bus: OsDevice) -> Result<Vec<OsDevice>, AcpiError> {
        let (bus_context, bus_node) = self.context_and_node(bus)?;
        let reported = self.devices.reported_children(bus);

        let mut published = Vec::new();
        for child in self.namespace.children(bus_node) {
            if !matches!(
                self.namespace.object_type(child),
                ObjectType::Device | ObjectType::Processor
            ) {
                continue;
            }
            let existing = {
                let store = self.store.lock();
                store
                    .context_of_node(child)
                    .map(|id| store.get(id).os_device)
            };
            if let Some(device) = existing {
                published.push(device);
                continue;
            }
            let attached = if reported.is_empty() {
                self.create_child(bus, bus_context, child)?
            } else {
                self.match_child(bus_context, child, &reported)?
            };
            if let Some(device) = attached {
                published.push(device);
            }
        }
        Ok(published)
    }

    /// Bus-driver role: creates an OS device for a namespace child.
    fn create_child(
        &self,
        bus: OsDevice,
        parent: ContextId,
        child: NodeHandle,
    ) -> Result<Option<OsDevice>, AcpiError> {
        let id = match device::hardware_id(self.namespace, child) {
            Ok(id) => id,
            Err(AcpiError::DeviceNotConnected) => {
                debug!("skipping a child with no usable hardware id");
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        let os_device = self.devices.create_device(bus, &id.text)?;
        let mut store = self.store.lock();
        let context =
            store.insert(DeviceContext::new(child, os_device, Some(parent), Role::BusDriver));
        store.get_mut(context).pci_bus = id.pci_bus;
        Ok(Some(os_device))
    }

    /// Filter role: pairs a namespace child with a device the bus
    /// driver reported, by bus address.
    fn match_child(
        &self,
        parent: ContextId,
        child: NodeHandle,
        reported: &[OsDevice],
    ) -> Result<Option<OsDevice>, AcpiError> {
        let Some(address) = device::query_bus_address(self.namespace, child)? else {
            return Ok(None);
        };
        let Some(matched) = reported
            .iter()
            .copied()
            .find(|&candidate| self.devices.bus_address(candidate) == Some(address))
        else {
            debug!("no reported device at bus address {address:#x}");
            return Ok(None);
        };
        // A bridge heads a PCI bus of its own; interrupt translation
        // climbs through it.
        let pci_bus = self.devices.is_pci_bridge(matched);
        let mut store = self.store.lock();
        let context = store.insert(DeviceContext::new(child, matched, Some(parent), Role::Filter));
        store.get_mut(context).bus_address = Some(address);
        store.get_mut(context).pci_bus = pci_bus;
        Ok(Some(matched))
    }

    /// Brings a device into service.
    ///
    /// Pushes the OS's chosen allocations back through `_SRS` when the
    /// device has a saved template, caches `_ADR`, and on a PCI bus
    /// builds the interrupt routing table from `_PRT` before marking
    /// the node started. Devices parked on this node as their provider
    /// are restarted. Processor nodes take their own path: the C-state
    /// table is decoded and counted toward the one-time idle-state
    /// registration.
    ///
    /// # Errors
    /// [`AcpiError::NoSuchDevice`] when `device` is not attached;
    /// `_SRS` emission and `_PRT` decoding errors pass through.
    pub fn start_device(&self, device: OsDevice) -> Result<(), AcpiError> {
        let (context, node, already_processor, pci_bus, template) = {
            let store = self.store.lock();
            let id = store
                .context_of_device(device)
                .ok_or(AcpiError::NoSuchDevice)?;
            let entry = store.get(id);
            (
                id,
                entry.node,
                entry.processor.is_some(),
                entry.pci_bus,
                entry.resource_template.clone(),
            )
        };
        // A processor that already went through a start keeps its state.
        if already_processor {
            return Ok(());
        }
        if self.namespace.object_type(node) == ObjectType::Processor {
            return self.start_processor(context, node);
        }

        if let Some(template) = &template
            && let Some(srs) = self.namespace.find_child(node, METHOD_SRS)
        {
            let assigned = self.devices.allocations(device);
            if !assigned.is_empty() {
                let buffer = resdesc::emit_allocations(template, &assigned)?;
                self.namespace.evaluate(srs, &[AcpiValue::Buffer(buffer)])?;
            }
        }

        let bus_address = device::query_bus_address(self.namespace, node)?;

        // `_PRT` methods poke PCI config space; the lock fences other
        // early consumers until the table is installed and the bus is
        // marked started.
        let pci_guard = pci_bus.then(|| self.pci_lock.lock());
        let routing = if pci_bus {
            match self.namespace.find_and_evaluate(node, METHOD_PRT, &[])? {
                Some(value) => Some(PciRoutingTable::from_package(self.namespace, node, &value)?),
                None => None,
            }
        } else {
            None
        };

        let dependents = {
            let mut store = self.store.lock();
            let entry = store.get_mut(context);
            if let Some(address) = bus_address {
                entry.bus_address = Some(address);
            }
            if routing.is_some() {
                entry.routing = routing;
            }
            entry.started = true;
            store.take_dependents(node)
        };
        drop(pci_guard);

        for dependent in dependents {
            debug!("restarting a device that waited on this one");
            self.devices.restart_device(dependent);
        }
        Ok(())
    }

    /// Processor start: decode the C-states and count toward the
    /// idle-state registration gate.
    fn start_processor(&self, context: ContextId, node: NodeHandle) -> Result<(), AcpiError> {
        let declaration = self
            .namespace
            .processor_declaration(node)
            .ok_or(AcpiError::InvalidConfiguration)?;
        let physical = self
            .madt
            .and_then(|view| view.processor_physical_id(declaration.processor_id));
        if physical.is_none() {
            let acpi_id = declaration.processor_id;
            warn!("processor {acpi_id} has no enabled MADT entry");
        }

        let table = match cstates::parse_cst(self.namespace, node)? {
            Some(table) => Some(table),
            None => cstates::fallback_table(
                &self.fadt,
                declaration.block_address,
                declaration.block_length,
            ),
        };

        let mut processor =
            ProcessorContext::new(declaration, physical.unwrap_or(declaration.processor_id));
        processor.cstates = table.clone();

        let dependents = {
            let mut store = self.store.lock();
            let entry = store.get_mut(context);
            entry.processor = Some(processor);
            entry.started = true;
            store.take_dependents(node)
        };
        for dependent in dependents {
            self.devices.restart_device(dependent);
        }

        // Processors without an enabled MADT entry never run; they do
        // not count toward the gate.
        let states = if physical.is_some() {
            self.processors.lock().processor_started(table.as_ref())
        } else {
            None
        };
        if let Some(states) = states {
            let count = states.len();
            info!("registering {count} processor idle states");
            self.system.register_idle_states(&states);
        }
        Ok(())
    }

    /// The device's resource picture, decoded from `_PRS` and `_CRS`.
    ///
    /// The raw `_CRS` template is saved on the context for the `_SRS`
    /// write at start. `_STA` gates only the boot allocations: a
    /// disabled device still reports what it could use. Interrupt pins
    /// of devices behind PCI are translated to GSIs before anything is
    /// returned.
    ///
    /// # Errors
    /// [`AcpiError::NotReady`] after parking on an unstarted resource
    /// provider or link node; template and routing errors pass through.
    pub fn query_resource_requirements(
        &self,
        device: OsDevice,
    ) -> Result<DeviceResources, AcpiError> {
        let (context, node) = self.context_and_node(device)?;
        let status = device::device_status(self.namespace, node)?;
        let current_bytes = self.template_bytes(node, METHOD_CRS)?;
        let possible_bytes = self.template_bytes(node, METHOD_PRS)?;

        let lookup = TemplateProviders {
            namespace: self.namespace,
            devices: self.devices,
            store: &self.store,
            anchor: node,
            dependent: device,
        };
        let current = match &current_bytes {
            Some(bytes) => resdesc::parse_template(bytes, &lookup)?,
            None => Vec::new(),
        };
        let mut configurations = match &possible_bytes {
            Some(bytes) => resdesc::parse_template(bytes, &lookup)?,
            None => current.clone(),
        };
        let mut boot = if status & STA_ENABLED == 0 {
            Vec::new()
        } else {
            boot_allocations(&current)
        };

        if let Some(bytes) = current_bytes {
            self.store.lock().get_mut(context).resource_template = Some(bytes);
        }

        routing::route_requirements(&self.store, self.devices, context, &mut configurations)?;
        routing::route_allocations(&self.store, self.devices, context, &mut boot)?;
        Ok(DeviceResources {
            configurations,
            boot,
        })
    }

    /// Rewrites an externally built resource list the way
    /// [`Platform::query_resource_requirements`] would: PCI interrupt
    /// pins become GSIs, everything else passes through untouched.
    ///
    /// # Errors
    /// Those of the routing walk, [`AcpiError::NotReady`] included.
    pub fn filter_resource_requirements(
        &self,
        device: OsDevice,
        configurations: &mut [Configuration],
        allocations: &mut [Allocation],
    ) -> Result<(), AcpiError> {
        let context = self.context_of(device)?;
        routing::route_requirements(&self.store, self.devices, context, configurations)?;
        routing::route_allocations(&self.store, self.devices, context, allocations)
    }

    /// Translates interrupt pin `line` (1 = INTA) of a device to a GSI.
    /// `Ok(None)` means the device is not behind any PCI bus.
    ///
    /// # Errors
    /// Those of the routing walk.
    pub fn translate_interrupt(
        &self,
        device: OsDevice,
        line: u16,
    ) -> Result<Option<InterruptRoute>, AcpiError> {
        let context = self.context_of(device)?;
        routing::translate_interrupt_line(&self.store, self.devices, context, line)
    }

    /// Switches the chipset from legacy SMI dispatch to SCI.
    ///
    /// # Errors
    /// [`AcpiError::Timeout`] when the hardware never acknowledges.
    pub fn enable_acpi_mode(&self) -> Result<(), AcpiError> {
        mode::enable_acpi_mode(self.system, &self.registers, &self.fadt)
    }

    /// Takes the firmware global lock; it is held until the guard
    /// drops.
    #[must_use]
    pub fn acquire_global_lock(&self) -> GlobalLockGuard<'_> {
        self.global_lock.acquire(self.system, &self.registers)
    }

    /// Whether the firmware declared sleep state `state`.
    #[must_use]
    pub fn supports_sleep_state(&self, state: u8) -> bool {
        self.sleep.supports(state)
    }

    /// Runs the firmware notifications (`\_TTS`, `\_PTS`) for a
    /// transition into `state`.
    ///
    /// # Errors
    /// [`AcpiError::InvalidParameter`] for a state past S5; a failing
    /// notification method aborts the transition.
    pub fn prepare_system_state_transition(&self, state: u8) -> Result<(), AcpiError> {
        sleep::prepare_system_state_transition(self.namespace, &self.sleep, state)
    }

    /// Writes the sleep vector for `state` into the PM1 control
    /// registers. The caller has put the machine in order; this is the
    /// point of no return for S4 and S5.
    ///
    /// # Errors
    /// [`AcpiError::NotSupported`] when the firmware did not declare
    /// the state, [`AcpiError::InvalidParameter`] past S5.
    pub fn perform_system_state_transition(&self, state: u8) -> Result<(), AcpiError> {
        sleep::perform_system_state_transition(self.system, &self.registers, &self.sleep, state)
    }

    /// Resets the platform through the FADT reset register.
    ///
    /// # Errors
    /// [`AcpiError::NotSupported`] without a usable reset register,
    /// [`AcpiError::Timeout`] when the machine is still running after
    /// the write.
    pub fn reset(&self) -> Result<(), AcpiError> {
        sleep::reset(self.system, &self.fadt)
    }

    /// The fixed-register cache, for the idle loop's state entry
    /// helpers.
    #[must_use]
    pub const fn registers(&self) -> &FixedRegisters {
        &self.registers
    }

    fn context_of(&self, device: OsDevice) -> Result<ContextId, AcpiError> {
        self.store
            .lock()
            .context_of_device(device)
            .ok_or(AcpiError::NoSuchDevice)
    }

    fn context_and_node(&self, device: OsDevice) -> Result<(ContextId, NodeHandle), AcpiError> {
        let store = self.store.lock();
        let id = store
            .context_of_device(device)
            .ok_or(AcpiError::NoSuchDevice)?;
        Ok((id, store.get(id).node))
    }

    /// Evaluates a `_CRS`/`_PRS`-style method to its template bytes.
    fn template_bytes(
        &self,
        node: NodeHandle,
        name: [u8; 4],
    ) -> Result<Option<Vec<u8>>, AcpiError> {
        match self.namespace.find_and_evaluate(node, name, &[])? {
            Some(value) => {
                let bytes = value.as_buffer().ok_or(AcpiError::UnexpectedType)?;
                Ok(Some(bytes.to_vec()))
            }
            None => Ok(None),
        }
    }
}

/// Resolves `ResourceSource` paths in templates against the device
/// store, parking a dependency when the named provider has not started.
struct TemplateProviders<'walk> {
    namespace: &'walk dyn Namespace,
    devices: &'walk dyn DeviceOps,
    store: &'walk SpinMutex<DeviceStore>,
    /// Node relative paths resolve from.
    anchor: NodeHandle,
    /// Device to restart once a missing provider starts.
    dependent: OsDevice,
}

impl ProviderLookup for TemplateProviders<'_> {
    fn resolve(&self, source: &str) -> Result<OsDevice, AcpiError> {
        let node = self
            .namespace
            .resolve_path(self.anchor, source)
            .ok_or(AcpiError::InvalidConfiguration)?;
        let mut store = self.store.lock();
        let id = store
            .context_of_node(node)
            .ok_or(AcpiError::InvalidConfiguration)?;
        if store.get(id).started {
            return Ok(store.get(id).os_device);
        }
        match store.add_dependency(self.dependent, node) {
            // The provider's start restarts the dependent, which will
            // query again.
            Ok(()) => Err(AcpiError::NotReady),
            // Raced the provider's start; it is ready after all.
            Err(AcpiError::TooLate) => Ok(store.get(id).os_device),
            Err(error) => Err(error),
        }
    }

    fn interrupt_controller_base(&self, provider: OsDevice) -> Option<u64> {
        // The controller's GSI range starts at its first interrupt
        // allocation.
        self.devices
            .allocations(provider)
            .iter()
            .find(|allocation| allocation.resource_type == ResourceType::InterruptLine)
            .map(|allocation| allocation.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::STA_PRESENT;
    use crate::namespace::{METHOD_ADR, METHOD_CST, METHOD_HID, METHOD_PTS, METHOD_STA, METHOD_TTS, ProcessorDeclaration};
    use crate::requirements::{INTERRUPT_LINE_ACTIVE_LOW, Requirement};
    use crate::testing::{ScriptedNamespace, TestDevices, TestSystem, fadt_with};
    use alloc::string::String;
    use alloc::vec;
    use core::sync::atomic::Ordering;
    use kernel_acpi_tables::fadt::FADT_FLAG_RESET_REGISTER_SUPPORTED;
    use kernel_acpi_tables::header::GenericAddress;

    /// `\_SB` with a serial port and a PCI root bus.
    fn two_device_bus() -> ScriptedNamespace {
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.system_bus();
        let com = namespace.add_device(bus, *b"COM1");
        namespace.add_method(
            com,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("PNP0501"))),
        );
        let pci = namespace.add_device(bus, *b"PCI0");
        namespace.add_method(
            pci,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("PNP0A03"))),
        );
        namespace
    }

    /// A small IRQ descriptor for `lines` plus the closing end tag.
    fn irq_template(mask: u16) -> Vec<u8> {
        let [low, high] = mask.to_le_bytes();
        vec![0x22, low, high, 0x79, 0x00]
    }

    /// A small I/O port descriptor (16-bit decode) plus the end tag.
    fn io_template(base: u16, length: u8) -> Vec<u8> {
        let [low, high] = base.to_le_bytes();
        vec![0x47, 0x01, low, high, low, high, 0x01, length, 0x79, 0x00]
    }

    /// A valid MADT with one enabled local APIC per `(acpi_id, apic_id)`
    /// pair.
    fn madt_bytes(processors: &[(u8, u8)]) -> Vec<u8> {
        let mut table = Vec::new();
        table.extend_from_slice(b"APIC");
        let length = 44 + processors.len() * 8;
        table.extend_from_slice(&u32::try_from(length).unwrap().to_le_bytes());
        table.push(3);
        table.push(0);
        table.extend_from_slice(b"FERRIT");
        table.extend_from_slice(&[0; 8]);
        table.extend_from_slice(&[0; 4]);
        table.extend_from_slice(&[0; 4]);
        table.extend_from_slice(&[0; 4]);
        table.extend_from_slice(&0xFEE0_0000_u32.to_le_bytes());
        table.extend_from_slice(&1_u32.to_le_bytes());
        for &(acpi_id, apic_id) in processors {
            table.extend_from_slice(&[0, 8, acpi_id, apic_id]);
            table.extend_from_slice(&1_u32.to_le_bytes());
        }
        let sum = table.iter().fold(0_u8, |acc, &byte| acc.wrapping_add(byte));
        table[9] = sum.wrapping_neg();
        table
    }

    /// A `_CST` register buffer naming the Intel native-halt entry.
    fn halt_register() -> AcpiValue {
        let mut bytes = vec![0x82, 12, 0, 0x7F, 0x01, 0x00, 0x00];
        bytes.extend_from_slice(&0_u64.to_le_bytes());
        AcpiValue::Buffer(bytes)
    }

    #[test]
    fn bus_enumeration_creates_devices_from_hardware_ids() {
        let mut namespace = two_device_bus();
        let bus = namespace.system_bus();
        // Method children are not enumerable.
        namespace.add_method(bus, *b"XQRY", Ok(AcpiValue::Integer(0)));
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.attach_root(OsDevice(1));
        let children = platform.query_children(OsDevice(1)).unwrap();
        assert_eq!(children, [OsDevice(100), OsDevice(101)]);

        let created = devices.created.lock();
        assert_eq!(
            *created,
            [
                (OsDevice(1), String::from("PNP0501"), OsDevice(100)),
                (OsDevice(1), String::from("PNP0A03"), OsDevice(101)),
            ]
        );
    }

    #[test]
    fn enumeration_is_idempotent() {
        let namespace = two_device_bus();
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.attach_root(OsDevice(1));
        let first = platform.query_children(OsDevice(1)).unwrap();
        let second = platform.query_children(OsDevice(1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(devices.created.lock().len(), 2);
    }

    #[test]
    fn children_without_ids_are_skipped() {
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.system_bus();
        namespace.add_device(bus, *b"NUL0");
        let com = namespace.add_device(bus, *b"COM1");
        namespace.add_method(
            com,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("PNP0501"))),
        );
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.attach_root(OsDevice(1));
        let children = platform.query_children(OsDevice(1)).unwrap();
        assert_eq!(children, [OsDevice(100)]);
    }

    #[test]
    fn failed_device_creation_aborts_enumeration() {
        let namespace = two_device_bus();
        let system = TestSystem::new();
        let devices = TestDevices::new();
        devices.fail_create.store(true, Ordering::Relaxed);
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.attach_root(OsDevice(1));
        assert_eq!(
            platform.query_children(OsDevice(1)),
            Err(AcpiError::InsufficientResources)
        );
    }

    #[test]
    fn unattached_devices_are_rejected() {
        let namespace = ScriptedNamespace::new();
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        assert_eq!(
            platform.start_device(OsDevice(99)),
            Err(AcpiError::NoSuchDevice)
        );
        assert_eq!(
            platform.query_children(OsDevice(99)),
            Err(AcpiError::NoSuchDevice)
        );
    }

    #[test]
    fn reported_children_switch_the_driver_to_filter_role() {
        let mut namespace = two_device_bus();
        let pci = namespace.resolve_path(namespace.system_bus(), "PCI0").unwrap();
        let eth = namespace.add_device(pci, *b"ETH0");
        namespace.add_method(eth, METHOD_ADR, Ok(AcpiValue::Integer(0x0002_0000)));
        let snd = namespace.add_device(pci, *b"SND0");
        namespace.add_method(snd, METHOD_ADR, Ok(AcpiValue::Integer(0x0005_0000)));
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.attach_root(OsDevice(1));
        platform.query_children(OsDevice(1)).unwrap();

        // The PCI driver enumerated the bus itself: two functions, one
        // with a namespace counterpart.
        devices
            .children
            .lock()
            .insert(OsDevice(101), vec![OsDevice(200), OsDevice(201)]);
        devices.bus_addresses.lock().insert(OsDevice(200), 0x0002_0000);
        devices.bus_addresses.lock().insert(OsDevice(201), 0x0003_0000);

        let children = platform.query_children(OsDevice(101)).unwrap();
        assert_eq!(children, [OsDevice(200)]);
        // Only the root-level devices were created by this driver.
        assert_eq!(devices.created.lock().len(), 2);
    }

    #[test]
    fn srs_runs_with_the_rewritten_template_at_start() {
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.system_bus();
        let com = namespace.add_device(bus, *b"COM1");
        namespace.add_method(
            com,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("PNP0501"))),
        );
        namespace.add_method(com, METHOD_CRS, Ok(AcpiValue::Buffer(irq_template(1 << 3))));
        let srs = namespace.add_method(com, METHOD_SRS, Ok(AcpiValue::Integer(0)));
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.attach_root(OsDevice(1));
        platform.query_children(OsDevice(1)).unwrap();
        let resources = platform.query_resource_requirements(OsDevice(100)).unwrap();
        assert_eq!(resources.configurations.len(), 1);
        assert_eq!(resources.boot[0].base, 3);

        // The OS moved the port to line 5.
        let mut moved = Allocation::from_requirement(&Requirement::new(ResourceType::InterruptLine));
        moved.base = 5;
        moved.length = 1;
        devices.allocations.lock().insert(OsDevice(100), vec![moved]);
        platform.start_device(OsDevice(100)).unwrap();

        assert_eq!(
            namespace.arguments(srs, 0),
            Some(vec![AcpiValue::Buffer(irq_template(1 << 5))])
        );
    }

    #[test]
    fn prs_wins_over_crs_for_requirements() {
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.system_bus();
        let com = namespace.add_device(bus, *b"COM1");
        namespace.add_method(
            com,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("PNP0501"))),
        );
        namespace.add_method(com, METHOD_CRS, Ok(AcpiValue::Buffer(io_template(0x3F8, 8))));
        namespace.add_method(com, METHOD_PRS, Ok(AcpiValue::Buffer(io_template(0x2F8, 8))));
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.attach_root(OsDevice(1));
        platform.query_children(OsDevice(1)).unwrap();
        let resources = platform.query_resource_requirements(OsDevice(100)).unwrap();

        assert_eq!(resources.configurations[0].requirements[0].minimum, 0x2F8);
        assert_eq!(resources.boot[0].base, 0x3F8);
        assert_eq!(resources.boot[0].length, 8);
    }

    #[test]
    fn disabled_devices_report_no_boot_allocations() {
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.system_bus();
        let com = namespace.add_device(bus, *b"COM1");
        namespace.add_method(
            com,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("PNP0501"))),
        );
        namespace.add_method(com, METHOD_CRS, Ok(AcpiValue::Buffer(io_template(0x3F8, 8))));
        namespace.add_method(
            com,
            METHOD_STA,
            Ok(AcpiValue::Integer(u64::from(STA_PRESENT))),
        );
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.attach_root(OsDevice(1));
        platform.query_children(OsDevice(1)).unwrap();
        let resources = platform.query_resource_requirements(OsDevice(100)).unwrap();

        assert!(resources.boot.is_empty());
        assert_eq!(resources.configurations.len(), 1);
    }

    #[test]
    fn link_routed_interrupts_wait_for_the_link_and_restart() {
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.system_bus();
        let pci = namespace.add_device(bus, *b"PCI0");
        namespace.add_method(
            pci,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("PNP0A03"))),
        );
        let link = namespace.add_device(bus, *b"LNKA");
        namespace.add_method(
            link,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("PNP0C0F"))),
        );
        namespace.add_method(
            pci,
            METHOD_PRT,
            Ok(AcpiValue::Package(vec![AcpiValue::Package(vec![
                AcpiValue::Integer(0x0003_FFFF),
                AcpiValue::Integer(0),
                AcpiValue::String(String::from("LNKA")),
                AcpiValue::Integer(0),
            ])])),
        );
        let eth = namespace.add_device(pci, *b"ETH0");
        namespace.add_method(
            eth,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("VEN1234"))),
        );
        namespace.add_method(eth, METHOD_CRS, Ok(AcpiValue::Buffer(irq_template(1 << 1))));
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.attach_root(OsDevice(1));
        let top = platform.query_children(OsDevice(1)).unwrap();
        assert_eq!(top, [OsDevice(100), OsDevice(101)]);
        platform.start_device(OsDevice(100)).unwrap();
        let below = platform.query_children(OsDevice(100)).unwrap();
        assert_eq!(below, [OsDevice(102)]);
        devices.bus_addresses.lock().insert(OsDevice(102), 0x0003_0000);

        // The link has not started: the query parks and reports
        // not-ready.
        assert_eq!(
            platform
                .query_resource_requirements(OsDevice(102))
                .unwrap_err(),
            AcpiError::NotReady
        );

        // The link starts with GSI 17 assigned; the card restarts.
        let mut gsi = Allocation::from_requirement(&Requirement::new(ResourceType::InterruptLine));
        gsi.base = 17;
        gsi.length = 1;
        gsi.characteristics = INTERRUPT_LINE_ACTIVE_LOW;
        devices.allocations.lock().insert(OsDevice(101), vec![gsi]);
        platform.start_device(OsDevice(101)).unwrap();
        assert_eq!(*devices.restarted.lock(), [OsDevice(102)]);

        // INTA now reads as GSI 17 in both lists.
        let resources = platform.query_resource_requirements(OsDevice(102)).unwrap();
        let requirement = &resources.configurations[0].requirements[0];
        assert_eq!(requirement.minimum, 17);
        assert_eq!(requirement.maximum, 18);
        assert_eq!(resources.boot[0].base, 17);

        // The park was consumed; nothing restarts twice.
        platform.start_device(OsDevice(101)).unwrap();
        assert_eq!(devices.restarted.lock().len(), 1);
    }

    #[test]
    fn processor_idle_states_register_after_the_last_start() {
        let table = madt_bytes(&[(0, 4), (1, 5)]);
        let madt = MadtView::parse(&table).unwrap();
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.system_bus();
        let cpu0 = namespace.add_processor(
            bus,
            *b"CPU0",
            ProcessorDeclaration {
                processor_id: 0,
                block_address: 0x1010,
                block_length: 6,
            },
        );
        namespace.add_processor(
            bus,
            *b"CPU1",
            ProcessorDeclaration {
                processor_id: 1,
                block_address: 0,
                block_length: 0,
            },
        );
        namespace.add_method(
            cpu0,
            METHOD_CST,
            Ok(AcpiValue::Package(vec![
                AcpiValue::Integer(1),
                AcpiValue::Package(vec![
                    halt_register(),
                    AcpiValue::Integer(1),
                    AcpiValue::Integer(1),
                    AcpiValue::Integer(1000),
                ]),
            ])),
        );
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, Some(madt)).unwrap();

        platform.attach_root(OsDevice(1));
        let children = platform.query_children(OsDevice(1)).unwrap();
        assert_eq!(children, [OsDevice(100), OsDevice(101)]);
        assert_eq!(devices.created.lock()[0].1, "ACPI0007");

        platform.start_device(OsDevice(100)).unwrap();
        assert!(system.idle_states.lock().is_empty());
        platform.start_device(OsDevice(101)).unwrap();
        {
            let registered = system.idle_states.lock();
            assert_eq!(registered.len(), 1);
            assert_eq!(registered[0].len(), 1);
            assert_eq!(registered[0][0].name, "C1");
        }

        // Restarting a processor is a no-op.
        platform.start_device(OsDevice(100)).unwrap();
        assert_eq!(system.idle_states.lock().len(), 1);
    }

    #[test]
    fn processors_missing_from_the_madt_do_not_gate_registration() {
        let table = madt_bytes(&[(0, 4)]);
        let madt = MadtView::parse(&table).unwrap();
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.system_bus();
        namespace.add_processor(
            bus,
            *b"CPU7",
            ProcessorDeclaration {
                processor_id: 7,
                block_address: 0,
                block_length: 0,
            },
        );
        namespace.add_processor(
            bus,
            *b"CPU0",
            ProcessorDeclaration {
                processor_id: 0,
                block_address: 0,
                block_length: 0,
            },
        );
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|_| {});
        let platform = Platform::new(&namespace, &system, &devices, &fadt, Some(madt)).unwrap();

        platform.attach_root(OsDevice(1));
        platform.query_children(OsDevice(1)).unwrap();

        // A processor the MADT never enabled starts without counting.
        platform.start_device(OsDevice(100)).unwrap();
        assert!(system.idle_states.lock().is_empty());

        platform.start_device(OsDevice(101)).unwrap();
        assert_eq!(system.idle_states.lock().len(), 1);
    }

    #[test]
    fn reset_is_the_last_action_after_the_sleep_handshake() {
        let mut namespace = ScriptedNamespace::new();
        let root = namespace.root();
        let tts = namespace.add_method(root, METHOD_TTS, Ok(AcpiValue::Integer(0)));
        let pts = namespace.add_method(root, METHOD_PTS, Ok(AcpiValue::Integer(0)));
        let system = TestSystem::new();
        let devices = TestDevices::new();
        let fadt = fadt_with(|fadt| {
            fadt.flags = FADT_FLAG_RESET_REGISTER_SUPPORTED;
            fadt.reset_register = GenericAddress::io(0xCF9, 1);
            fadt.reset_value = 0x6;
        });
        let platform = Platform::new(&namespace, &system, &devices, &fadt, None).unwrap();

        platform.prepare_system_state_transition(5).unwrap();
        assert_eq!(platform.reset(), Err(AcpiError::Timeout));

        assert_eq!(namespace.arguments(tts, 0), Some(vec![AcpiValue::Integer(5)]));
        assert_eq!(namespace.arguments(pts, 0), Some(vec![AcpiValue::Integer(5)]));
        // The reset write is the only port access of the whole exchange.
        assert_eq!(*system.port_writes.lock(), [(0xCF9, 0x6)]);
    }
}
