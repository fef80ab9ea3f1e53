//! # PCI Interrupt Routing
//!
//! PCI functions raise one of four pins; which GSI a pin reaches is the
//! firmware's business, described by `_PRT` packages on PCI bus nodes.
//! An entry either names the GSI directly or points at a link node whose
//! current allocation names it.
//!
//! Translation climbs the device tree. A routing table is authoritative:
//! once one answers, nothing above it is consulted. A bridge without a
//! table swizzles the pin by the child's device number and the climb
//! continues. The walk takes the device-list lock per step and never
//! holds it across kernel callbacks.

use alloc::vec::Vec;

use kernel_sync::SpinMutex;

use crate::device::{ContextId, DeviceOps, DeviceStore, OsDevice};
use crate::namespace::{AcpiValue, Namespace, NodeHandle};
use crate::requirements::{
    Allocation, Configuration, INTERRUPT_LINE_ACTIVE_LOW, INTERRUPT_LINE_SECONDARY, Requirement,
    ResourceType,
};
use crate::AcpiError;

/// One decoded `_PRT` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    /// PCI device number, the address' high word.
    pub slot: u16,
    /// Interrupt pin, zero based (0 = INTA).
    pub line: u16,
    /// Link node that owns the routing, when the source is a device.
    pub routing_device: Option<NodeHandle>,
    /// Index into the link's allocation list.
    pub resource_index: u32,
    /// Literal GSI, when there is no routing device.
    pub gsi: u32,
}

/// Routing table of one PCI bus, built from `_PRT`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciRoutingTable {
    entries: Vec<RoutingEntry>,
}

impl PciRoutingTable {
    /// Decodes a `_PRT` package. `bus` anchors relative source paths.
    ///
    /// # Errors
    /// [`AcpiError::UnexpectedType`] for a malformed package shape,
    /// [`AcpiError::InvalidParameter`] for an out-of-range pin, and
    /// [`AcpiError::NoSuchDevice`] when a source path does not resolve.
    pub fn from_package(
        namespace: &dyn Namespace,
        bus: NodeHandle,
        value: &AcpiValue,
    ) -> Result<Self, AcpiError> {
        let elements = value.as_package().ok_or(AcpiError::UnexpectedType)?;
        let mut entries = Vec::with_capacity(elements.len());
        for element in elements {
            entries.push(parse_entry(namespace, bus, element)?);
        }
        Ok(Self { entries })
    }

    /// The entry for a device/pin pair.
    #[must_use]
    pub fn lookup(&self, slot: u16, line: u16) -> Option<&RoutingEntry> {
        self.entries
            .iter()
            .find(|entry| entry.slot == slot && entry.line == line)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_entry(
    namespace: &dyn Namespace,
    bus: NodeHandle,
    element: &AcpiValue,
) -> Result<RoutingEntry, AcpiError> {
    let Some([address, pin, source, source_index]) = element.as_package() else {
        return Err(AcpiError::UnexpectedType);
    };
    let address = address.as_integer().ok_or(AcpiError::UnexpectedType)?;
    let pin = pin.as_integer().ok_or(AcpiError::UnexpectedType)?;
    let index = source_index.as_integer().ok_or(AcpiError::UnexpectedType)?;
    if pin > 3 {
        return Err(AcpiError::InvalidParameter);
    }
    let line = u16::try_from(pin).map_err(|_| AcpiError::InvalidParameter)?;
    let slot = u16::try_from((address >> 16) & 0xFFFF).map_err(|_| AcpiError::InvalidParameter)?;
    let index = u32::try_from(index).map_err(|_| AcpiError::InvalidParameter)?;

    let routing_device = match source {
        AcpiValue::Integer(_) => None,
        AcpiValue::Reference(node) => Some(*node),
        AcpiValue::String(path) => Some(
            namespace
                .resolve_path(bus, path)
                .ok_or(AcpiError::NoSuchDevice)?,
        ),
        _ => return Err(AcpiError::UnexpectedType),
    };
    Ok(match routing_device {
        Some(node) => RoutingEntry {
            slot,
            line,
            routing_device: Some(node),
            resource_index: index,
            gsi: 0,
        },
        None => RoutingEntry {
            slot,
            line,
            routing_device: None,
            resource_index: 0,
            gsi: index,
        },
    })
}

/// A translated interrupt: the GSI plus what the routing element says
/// about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptRoute {
    pub gsi: u32,
    pub characteristics: u64,
    /// Flags adopted from a link-node allocation; `None` keeps the
    /// requirement's own flags.
    pub flags: Option<u32>,
}

struct ClimbStep {
    parent: ContextId,
    pci_bus: bool,
    routing: Option<PciRoutingTable>,
    child_address: Option<u64>,
    child_device: OsDevice,
}

/// PCI device number of the child below the parent under inspection.
fn child_slot(devices: &dyn DeviceOps, step: &ClimbStep) -> Result<u16, AcpiError> {
    let address = step
        .child_address
        .or_else(|| devices.bus_address(step.child_device))
        .ok_or(AcpiError::NoSuchDevice)?;
    u16::try_from((address >> 16) & 0xFFFF).map_err(|_| AcpiError::NoSuchDevice)
}

/// Adopts the GSI named by a link node's current allocation.
fn link_route(
    store: &SpinMutex<DeviceStore>,
    devices: &dyn DeviceOps,
    dependent: OsDevice,
    link: NodeHandle,
    resource_index: u32,
) -> Result<InterruptRoute, AcpiError> {
    let link_device = {
        let mut guard = store.lock();
        let started = guard
            .context_of_node(link)
            .is_some_and(|id| guard.get(id).started);
        if !started {
            match guard.add_dependency(dependent, link) {
                // The link's start will restart this device.
                Ok(()) => return Err(AcpiError::NotReady),
                // Lost the race against the link's start; it is ready.
                Err(AcpiError::TooLate) => {}
                Err(error) => return Err(error),
            }
        }
        guard
            .context_of_node(link)
            .map(|id| guard.get(id).os_device)
            .ok_or(AcpiError::NoSuchDevice)?
    };

    let allocations = devices.allocations(link_device);
    let index = usize::try_from(resource_index).map_err(|_| AcpiError::ConversionFailed)?;
    let allocation = allocations.get(index).ok_or(AcpiError::ConversionFailed)?;
    if allocation.resource_type != ResourceType::InterruptLine {
        return Err(AcpiError::ConversionFailed);
    }
    let gsi = u32::try_from(allocation.base).map_err(|_| AcpiError::ConversionFailed)?;
    Ok(InterruptRoute {
        gsi,
        characteristics: allocation.characteristics,
        flags: Some(allocation.flags),
    })
}

/// Translates interrupt pin `line` (1..=4) of the device at `start` to a
/// GSI. `Ok(None)` means the device is not behind any PCI bus and the
/// line stands as is.
///
/// # Errors
/// [`AcpiError::NotReady`] after parking on an unstarted link node,
/// [`AcpiError::NoSuchDevice`] when a routing table has no entry for the
/// pin, [`AcpiError::ConversionFailed`] when a link's allocation list
/// does not name an interrupt at the routed index.
pub fn translate_interrupt_line(
    store: &SpinMutex<DeviceStore>,
    devices: &dyn DeviceOps,
    start: ContextId,
    line: u16,
) -> Result<Option<InterruptRoute>, AcpiError> {
    if !(1..=4).contains(&line) {
        return Err(AcpiError::InvalidParameter);
    }
    let dependent = store.lock().get(start).os_device;
    let mut current = start;
    let mut line = line;
    let mut behind_pci = false;
    loop {
        let Some(step) = climb(store, current) else {
            break;
        };
        if step.pci_bus {
            behind_pci = true;
            let slot = child_slot(devices, &step)?;
            if let Some(table) = &step.routing {
                let entry = table.lookup(slot, line - 1).ok_or(AcpiError::NoSuchDevice)?;
                return match entry.routing_device {
                    None => Ok(Some(InterruptRoute {
                        gsi: entry.gsi,
                        characteristics: INTERRUPT_LINE_ACTIVE_LOW,
                        flags: None,
                    })),
                    Some(link) => {
                        link_route(store, devices, dependent, link, entry.resource_index).map(Some)
                    }
                };
            }
            line = ((line - 1 + slot % 4) % 4) + 1;
        }
        current = step.parent;
    }
    if behind_pci {
        return Err(AcpiError::NoSuchDevice);
    }
    Ok(None)
}

/// Snapshot of one parent link in the tree, taken under the store lock.
fn climb(store: &SpinMutex<DeviceStore>, current: ContextId) -> Option<ClimbStep> {
    let guard = store.lock();
    let child = guard.get(current);
    let parent = child.parent?;
    let context = guard.get(parent);
    Some(ClimbStep {
        parent,
        pci_bus: context.pci_bus,
        routing: context.routing.clone(),
        child_address: child.bus_address,
        child_device: child.os_device,
    })
}

fn route_requirement(
    store: &SpinMutex<DeviceStore>,
    devices: &dyn DeviceOps,
    context: ContextId,
    requirement: &mut Requirement,
) -> Result<(), AcpiError> {
    if requirement.resource_type != ResourceType::InterruptLine
        || requirement.characteristics & INTERRUPT_LINE_SECONDARY != 0
        || !(1..=4).contains(&requirement.minimum)
    {
        return Ok(());
    }
    let line = u16::try_from(requirement.minimum).map_err(|_| AcpiError::InvalidParameter)?;
    let Some(route) = translate_interrupt_line(store, devices, context, line)? else {
        return Ok(());
    };
    requirement.minimum = u64::from(route.gsi);
    requirement.maximum = u64::from(route.gsi) + 1;
    requirement.length = 1;
    requirement.alignment = 1;
    requirement.characteristics = route.characteristics;
    if let Some(flags) = route.flags {
        requirement.flags = flags;
    }
    Ok(())
}

/// Rewrites PCI interrupt pins in a requirement list to GSIs, so that
/// downstream drivers only ever see flat interrupt numbers.
///
/// # Errors
/// Those of [`translate_interrupt_line`].
pub fn route_requirements(
    store: &SpinMutex<DeviceStore>,
    devices: &dyn DeviceOps,
    context: ContextId,
    configurations: &mut [Configuration],
) -> Result<(), AcpiError> {
    for configuration in configurations.iter_mut() {
        for requirement in &mut configuration.requirements {
            route_requirement(store, devices, context, requirement)?;
            for alternative in &mut requirement.alternatives {
                route_requirement(store, devices, context, alternative)?;
            }
        }
    }
    Ok(())
}

/// Rewrites PCI interrupt pins in a boot allocation list to GSIs.
///
/// # Errors
/// Those of [`translate_interrupt_line`].
pub fn route_allocations(
    store: &SpinMutex<DeviceStore>,
    devices: &dyn DeviceOps,
    context: ContextId,
    allocations: &mut [Allocation],
) -> Result<(), AcpiError> {
    for allocation in allocations.iter_mut() {
        if allocation.resource_type != ResourceType::InterruptLine
            || allocation.characteristics & INTERRUPT_LINE_SECONDARY != 0
            || !(1..=4).contains(&allocation.base)
        {
            continue;
        }
        let line = u16::try_from(allocation.base).map_err(|_| AcpiError::InvalidParameter)?;
        let Some(route) = translate_interrupt_line(store, devices, context, line)? else {
            continue;
        };
        allocation.base = u64::from(route.gsi);
        allocation.characteristics = route.characteristics;
        if let Some(flags) = route.flags {
            allocation.flags = flags;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceContext, Role};
    use crate::requirements::RESOURCE_FLAG_NOT_SHAREABLE;
    use crate::testing::{ScriptedNamespace, TestDevices};
    use alloc::string::String;
    use alloc::vec;

    fn gsi_entry(slot: u16, line: u16, gsi: u32) -> RoutingEntry {
        RoutingEntry {
            slot,
            line,
            routing_device: None,
            resource_index: 0,
            gsi,
        }
    }

    fn link_entry(slot: u16, line: u16, link: NodeHandle, resource_index: u32) -> RoutingEntry {
        RoutingEntry {
            slot,
            line,
            routing_device: Some(link),
            resource_index,
            gsi: 0,
        }
    }

    fn table(entries: Vec<RoutingEntry>) -> PciRoutingTable {
        PciRoutingTable { entries }
    }

    fn prt_element(address: u64, pin: u64, source: AcpiValue, index: u64) -> AcpiValue {
        AcpiValue::Package(vec![
            AcpiValue::Integer(address),
            AcpiValue::Integer(pin),
            source,
            AcpiValue::Integer(index),
        ])
    }

    /// Root bus context with the given routing table; returns (root id,
    /// child id) with the child at the given PCI address.
    fn pci_tree(
        store: &SpinMutex<DeviceStore>,
        routing: Option<PciRoutingTable>,
        child_address: Option<u64>,
    ) -> (ContextId, ContextId) {
        let mut guard = store.lock();
        let root = guard.insert(DeviceContext::new(
            NodeHandle(1),
            OsDevice(1),
            None,
            Role::BusDriver,
        ));
        guard.get_mut(root).pci_bus = true;
        guard.get_mut(root).routing = routing;
        guard.get_mut(root).started = true;
        let child = guard.insert(DeviceContext::new(
            NodeHandle(5),
            OsDevice(2),
            Some(root),
            Role::Filter,
        ));
        guard.get_mut(child).bus_address = child_address;
        (root, child)
    }

    #[test]
    fn prt_package_decodes_both_source_forms() {
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.add_device(namespace.system_bus(), *b"PCI0");
        let link = namespace.add_device(namespace.system_bus(), *b"LNKA");
        let package = AcpiValue::Package(vec![
            prt_element(0x001F_FFFF, 0, AcpiValue::Integer(0), 16),
            prt_element(0x0004_FFFF, 2, AcpiValue::String(String::from("LNKA")), 1),
            prt_element(0x0004_FFFF, 3, AcpiValue::Reference(link), 0),
        ]);

        let prt = PciRoutingTable::from_package(&namespace, bus, &package).unwrap();
        assert_eq!(prt.len(), 3);
        assert_eq!(prt.lookup(0x1F, 0).unwrap().gsi, 16);
        let by_path = prt.lookup(4, 2).unwrap();
        assert_eq!(by_path.routing_device, Some(link));
        assert_eq!(by_path.resource_index, 1);
        assert_eq!(prt.lookup(4, 3).unwrap().routing_device, Some(link));
        assert!(prt.lookup(0, 0).is_none());
    }

    #[test]
    fn malformed_prt_elements_are_rejected() {
        let namespace = ScriptedNamespace::new();
        let bus = namespace.system_bus();

        let not_a_package = AcpiValue::Package(vec![AcpiValue::Integer(0)]);
        assert_eq!(
            PciRoutingTable::from_package(&namespace, bus, &not_a_package),
            Err(AcpiError::UnexpectedType)
        );

        let bad_pin = AcpiValue::Package(vec![prt_element(0, 4, AcpiValue::Integer(0), 0)]);
        assert_eq!(
            PciRoutingTable::from_package(&namespace, bus, &bad_pin),
            Err(AcpiError::InvalidParameter)
        );

        let dangling = AcpiValue::Package(vec![prt_element(
            0,
            0,
            AcpiValue::String(String::from("LNKZ")),
            0,
        )]);
        assert_eq!(
            PciRoutingTable::from_package(&namespace, bus, &dangling),
            Err(AcpiError::NoSuchDevice)
        );
    }

    #[test]
    fn direct_gsi_entry_answers_the_walk() {
        let store = SpinMutex::new(DeviceStore::new());
        let (_, child) = pci_tree(
            &store,
            Some(table(vec![gsi_entry(0x1F, 0, 16)])),
            Some(0x001F_0000),
        );
        let devices = TestDevices::new();

        let route = translate_interrupt_line(&store, &devices, child, 1).unwrap();
        assert_eq!(
            route,
            Some(InterruptRoute {
                gsi: 16,
                characteristics: INTERRUPT_LINE_ACTIVE_LOW,
                flags: None,
            })
        );
    }

    #[test]
    fn kernel_supplies_the_bus_address_when_uncached() {
        let store = SpinMutex::new(DeviceStore::new());
        let (_, child) = pci_tree(&store, Some(table(vec![gsi_entry(0x1F, 0, 16)])), None);
        let devices = TestDevices::new();
        devices.bus_addresses.lock().insert(OsDevice(2), 0x001F_0000);

        let route = translate_interrupt_line(&store, &devices, child, 1).unwrap();
        assert_eq!(route.unwrap().gsi, 16);
    }

    #[test]
    fn started_link_node_lends_its_allocation() {
        let link_node = NodeHandle(9);
        let store = SpinMutex::new(DeviceStore::new());
        let (_, child) = pci_tree(
            &store,
            Some(table(vec![link_entry(4, 2, link_node, 1)])),
            Some(0x0004_0000),
        );
        {
            let mut guard = store.lock();
            let link = guard.insert(DeviceContext::new(
                link_node,
                OsDevice(50),
                None,
                Role::BusDriver,
            ));
            guard.get_mut(link).started = true;
        }
        let devices = TestDevices::new();
        let mut irq = Allocation::from_requirement(&Requirement::new(ResourceType::InterruptLine));
        irq.base = 17;
        irq.length = 1;
        irq.characteristics = INTERRUPT_LINE_ACTIVE_LOW;
        irq.flags = RESOURCE_FLAG_NOT_SHAREABLE;
        let io = Allocation::from_requirement(&Requirement::new(ResourceType::IoPort));
        devices.allocations.lock().insert(OsDevice(50), vec![io, irq]);

        let route = translate_interrupt_line(&store, &devices, child, 3).unwrap();
        assert_eq!(
            route,
            Some(InterruptRoute {
                gsi: 17,
                characteristics: INTERRUPT_LINE_ACTIVE_LOW,
                flags: Some(RESOURCE_FLAG_NOT_SHAREABLE),
            })
        );
    }

    #[test]
    fn unstarted_link_parks_a_dependency() {
        let link_node = NodeHandle(9);
        let store = SpinMutex::new(DeviceStore::new());
        let (_, child) = pci_tree(
            &store,
            Some(table(vec![link_entry(4, 2, link_node, 0)])),
            Some(0x0004_0000),
        );
        let devices = TestDevices::new();

        assert_eq!(
            translate_interrupt_line(&store, &devices, child, 3),
            Err(AcpiError::NotReady)
        );
        let mut guard = store.lock();
        assert_eq!(guard.dependency_count(), 1);
        assert_eq!(guard.take_dependents(link_node), [OsDevice(2)]);
    }

    #[test]
    fn link_allocation_of_the_wrong_type_fails_conversion() {
        let link_node = NodeHandle(9);
        let store = SpinMutex::new(DeviceStore::new());
        let (_, child) = pci_tree(
            &store,
            Some(table(vec![link_entry(4, 0, link_node, 0)])),
            Some(0x0004_0000),
        );
        {
            let mut guard = store.lock();
            let link = guard.insert(DeviceContext::new(
                link_node,
                OsDevice(50),
                None,
                Role::BusDriver,
            ));
            guard.get_mut(link).started = true;
        }
        let devices = TestDevices::new();
        let io = Allocation::from_requirement(&Requirement::new(ResourceType::IoPort));
        devices.allocations.lock().insert(OsDevice(50), vec![io]);

        assert_eq!(
            translate_interrupt_line(&store, &devices, child, 1),
            Err(AcpiError::ConversionFailed)
        );
    }

    #[test]
    fn prt_less_bridge_swizzles_by_the_child_slot() {
        let store = SpinMutex::new(DeviceStore::new());
        let (_, bridge_child) = pci_tree(
            &store,
            Some(table(vec![gsi_entry(3, 1, 21)])),
            Some(0x0003_0000),
        );
        let child = {
            let mut guard = store.lock();
            guard.get_mut(bridge_child).pci_bus = true;
            let child = guard.insert(DeviceContext::new(
                NodeHandle(6),
                OsDevice(3),
                Some(bridge_child),
                Role::Filter,
            ));
            guard.get_mut(child).bus_address = Some(0x0005_0000);
            child
        };
        let devices = TestDevices::new();

        // Slot 5, INTA at the bridge becomes INTB at the root's slot 3.
        let route = translate_interrupt_line(&store, &devices, child, 1).unwrap();
        assert_eq!(route.unwrap().gsi, 21);
    }

    #[test]
    fn device_outside_any_pci_bus_keeps_its_line() {
        let store = SpinMutex::new(DeviceStore::new());
        let child = {
            let mut guard = store.lock();
            let root = guard.insert(DeviceContext::new(
                NodeHandle(1),
                OsDevice(1),
                None,
                Role::BusDriver,
            ));
            guard.insert(DeviceContext::new(
                NodeHandle(5),
                OsDevice(2),
                Some(root),
                Role::Filter,
            ))
        };
        let devices = TestDevices::new();

        assert_eq!(
            translate_interrupt_line(&store, &devices, child, 1),
            Ok(None)
        );
    }

    #[test]
    fn missing_prt_entry_is_no_such_device() {
        let store = SpinMutex::new(DeviceStore::new());
        let (_, child) = pci_tree(&store, Some(table(vec![])), Some(0x001F_0000));
        let devices = TestDevices::new();

        assert_eq!(
            translate_interrupt_line(&store, &devices, child, 1),
            Err(AcpiError::NoSuchDevice)
        );
    }

    #[test]
    fn requirement_lists_are_rewritten_in_place() {
        let store = SpinMutex::new(DeviceStore::new());
        let (_, child) = pci_tree(
            &store,
            Some(table(vec![gsi_entry(0x1F, 0, 16)])),
            Some(0x001F_0000),
        );
        let devices = TestDevices::new();

        let mut memory = Requirement::new(ResourceType::PhysicalAddressSpace);
        memory.minimum = 0xE000_0000;
        memory.maximum = 0xE002_0000;
        memory.length = 0x2_0000;
        let mut inta = Requirement::new(ResourceType::InterruptLine);
        inta.minimum = 1;
        inta.maximum = 2;
        inta.length = 1;
        let mut secondary = Requirement::new(ResourceType::InterruptLine);
        secondary.minimum = 4;
        secondary.maximum = 5;
        secondary.length = 1;
        secondary.characteristics = INTERRUPT_LINE_SECONDARY;
        let mut configurations = vec![Configuration {
            requirements: vec![memory.clone(), inta, secondary.clone()],
        }];

        route_requirements(&store, &devices, child, &mut configurations).unwrap();
        let requirements = &configurations[0].requirements;
        assert_eq!(requirements[0], memory);
        assert_eq!(requirements[1].minimum, 16);
        assert_eq!(requirements[1].maximum, 17);
        assert_eq!(requirements[1].characteristics, INTERRUPT_LINE_ACTIVE_LOW);
        assert_eq!(requirements[2], secondary);
    }

    #[test]
    fn boot_allocations_are_rewritten_in_place() {
        let store = SpinMutex::new(DeviceStore::new());
        let (_, child) = pci_tree(
            &store,
            Some(table(vec![gsi_entry(0x1F, 1, 18)])),
            Some(0x001F_0000),
        );
        let devices = TestDevices::new();

        let mut intb = Allocation::from_requirement(&Requirement::new(ResourceType::InterruptLine));
        intb.base = 2;
        intb.length = 1;
        let mut allocations = vec![intb];

        route_allocations(&store, &devices, child, &mut allocations).unwrap();
        assert_eq!(allocations[0].base, 18);
        assert_eq!(allocations[0].characteristics, INTERRUPT_LINE_ACTIVE_LOW);
    }
}
