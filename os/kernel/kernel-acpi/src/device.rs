//! # Device Contexts and Dependencies
//!
//! One [`DeviceContext`] exists per (namespace node, OS device) pair. The
//! context keeps the node handle, the start state, and the caches filled
//! during start: the `_ADR` bus address, the saved current-resources
//! template, the PCI routing table, and processor state.
//!
//! Contexts live in a [`DeviceStore`] behind the platform's device-list
//! spin lock. The store also records dependency edges: a device whose
//! resources name a provider that has not started yet parks itself on
//! such an edge and is restarted when the provider comes online.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use kernel_acpi_tables::eisa::{EISA_ID_PCI_BUS, EISA_ID_PCI_EXPRESS_BUS, EisaId};

use crate::cstates::ProcessorContext;
use crate::namespace::{
    AcpiValue, METHOD_ADR, METHOD_HID, METHOD_STA, Namespace, NodeHandle, ObjectType,
};
use crate::requirements::Allocation;
use crate::routing::PciRoutingTable;
use crate::AcpiError;

/// Opaque handle of a kernel device object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsDevice(pub u64);

/// Kernel device services the platform driver calls out to.
pub trait DeviceOps: Sync {
    /// Creates a physical device object below `parent`, named by the
    /// hardware identifier.
    ///
    /// # Errors
    /// Whatever the kernel's object layer reports.
    fn create_device(&self, parent: OsDevice, hardware_id: &str) -> Result<OsDevice, AcpiError>;

    /// Clears a failed device's problem state so the kernel runs its
    /// start sequence again.
    fn restart_device(&self, device: OsDevice);

    /// The committed allocation list of a started device.
    fn allocations(&self, device: OsDevice) -> Vec<Allocation>;

    /// The bus address the kernel recorded for a device.
    fn bus_address(&self, device: OsDevice) -> Option<u64>;

    /// Children an existing bus driver reported below `bus`. Empty when
    /// nothing enumerates the bus, in which case this driver takes the
    /// bus-driver role itself.
    fn reported_children(&self, bus: OsDevice) -> Vec<OsDevice>;

    /// Whether the kernel identified the device as a PCI-to-PCI bridge.
    fn is_pci_bridge(&self, device: OsDevice) -> bool;
}

/// How this driver is attached to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No other bus driver enumerates the parent; this driver creates
    /// and owns the child devices.
    BusDriver,
    /// Another bus driver enumerates; this driver attaches for resources
    /// and interrupt routing.
    Filter,
}

/// Index of a context within its [`DeviceStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextId(usize);

/// Per-device driver state.
pub struct DeviceContext {
    pub node: NodeHandle,
    pub os_device: OsDevice,
    pub parent: Option<ContextId>,
    pub role: Role,
    /// Cached `_ADR` result, filled during start.
    pub bus_address: Option<u64>,
    /// Raw `_CRS` template saved by the last resource query; `_SRS`
    /// emission rewrites a copy of it.
    pub resource_template: Option<Vec<u8>>,
    /// Routing table built from `_PRT` when the node is a PCI bus.
    pub routing: Option<PciRoutingTable>,
    /// The node is a PCI root bus or bridge.
    pub pci_bus: bool,
    /// Start completed for this context.
    pub started: bool,
    /// Processor state, for processor devices.
    pub processor: Option<ProcessorContext>,
}

impl DeviceContext {
    #[must_use]
    pub const fn new(
        node: NodeHandle,
        os_device: OsDevice,
        parent: Option<ContextId>,
        role: Role,
    ) -> Self {
        Self {
            node,
            os_device,
            parent,
            role,
            bus_address: None,
            resource_template: None,
            routing: None,
            pci_bus: false,
            started: false,
            processor: None,
        }
    }
}

struct Dependency {
    dependent: OsDevice,
    provider: NodeHandle,
}

/// Contexts and dependency edges, guarded by the platform's device-list
/// lock. Nothing in here evaluates AML.
#[derive(Default)]
pub struct DeviceStore {
    contexts: Vec<DeviceContext>,
    by_node: BTreeMap<NodeHandle, ContextId>,
    by_device: BTreeMap<OsDevice, ContextId>,
    dependencies: Vec<Dependency>,
}

impl DeviceStore {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            contexts: Vec::new(),
            by_node: BTreeMap::new(),
            by_device: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }

    /// Adds a context, or returns the existing one for the same node so
    /// repeated enumeration stays idempotent.
    pub fn insert(&mut self, context: DeviceContext) -> ContextId {
        if let Some(&existing) = self.by_node.get(&context.node) {
            return existing;
        }
        let id = ContextId(self.contexts.len());
        self.by_node.insert(context.node, id);
        self.by_device.insert(context.os_device, id);
        self.contexts.push(context);
        id
    }

    #[must_use]
    pub fn get(&self, id: ContextId) -> &DeviceContext {
        &self.contexts[id.0]
    }

    pub fn get_mut(&mut self, id: ContextId) -> &mut DeviceContext {
        &mut self.contexts[id.0]
    }

    #[must_use]
    pub fn context_of_node(&self, node: NodeHandle) -> Option<ContextId> {
        self.by_node.get(&node).copied()
    }

    #[must_use]
    pub fn context_of_device(&self, device: OsDevice) -> Option<ContextId> {
        self.by_device.get(&device).copied()
    }

    /// Records that `dependent` waits for the node's device to start.
    ///
    /// # Errors
    /// [`AcpiError::TooLate`] when the provider started while the record
    /// was being created; the caller proceeds as if it had been ready.
    pub fn add_dependency(
        &mut self,
        dependent: OsDevice,
        provider: NodeHandle,
    ) -> Result<(), AcpiError> {
        if let Some(id) = self.context_of_node(provider)
            && self.get(id).started
        {
            return Err(AcpiError::TooLate);
        }
        let duplicate = self
            .dependencies
            .iter()
            .any(|edge| edge.dependent == dependent && edge.provider == provider);
        if !duplicate {
            self.dependencies.push(Dependency {
                dependent,
                provider,
            });
        }
        Ok(())
    }

    /// Removes and returns every device waiting on `provider`.
    pub fn take_dependents(&mut self, provider: NodeHandle) -> Vec<OsDevice> {
        let mut dependents = Vec::new();
        self.dependencies.retain(|edge| {
            if edge.provider == provider {
                dependents.push(edge.dependent);
                false
            } else {
                true
            }
        });
        dependents
    }

    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }
}

/// `_STA`: device is physically present.
pub const STA_PRESENT: u32 = 0x1;
/// `_STA`: device is enabled and decoding its resources.
pub const STA_ENABLED: u32 = 0x2;
/// `_STA`: device should be shown in the UI.
pub const STA_SHOW_IN_UI: u32 = 0x4;
/// `_STA`: device is functioning properly.
pub const STA_FUNCTIONING: u32 = 0x8;
/// `_STA`: the battery is present.
pub const STA_BATTERY: u32 = 0x10;

/// Status assumed for devices without a `_STA` method.
pub const STA_DEFAULT: u32 =
    STA_PRESENT | STA_ENABLED | STA_SHOW_IN_UI | STA_FUNCTIONING | STA_BATTERY;

/// Evaluates `_STA`. A device without the method is fully functional.
///
/// # Errors
/// [`AcpiError::UnexpectedType`] when the method yields something other
/// than a 32-bit integer, or the interpreter's evaluation error.
pub fn device_status(namespace: &dyn Namespace, node: NodeHandle) -> Result<u32, AcpiError> {
    let Some(value) = namespace.find_and_evaluate(node, METHOD_STA, &[])? else {
        return Ok(STA_DEFAULT);
    };
    let status = value.as_integer().ok_or(AcpiError::UnexpectedType)?;
    u32::try_from(status).map_err(|_| AcpiError::UnexpectedType)
}

/// Evaluates `_ADR`. `Ok(None)` when the device has no bus address.
///
/// # Errors
/// [`AcpiError::UnexpectedType`] for a non-integer result, or the
/// interpreter's evaluation error.
pub fn query_bus_address(
    namespace: &dyn Namespace,
    node: NodeHandle,
) -> Result<Option<u64>, AcpiError> {
    let Some(value) = namespace.find_and_evaluate(node, METHOD_ADR, &[])? else {
        return Ok(None);
    };
    value
        .as_integer()
        .ok_or(AcpiError::UnexpectedType)
        .map(Some)
}

/// Identifier reported for processor devices, which carry no `_HID`.
pub const PROCESSOR_HARDWARE_ID: &str = "ACPI0007";

/// A device identifier derived from `_HID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareId {
    /// Text form, either the decoded EISA id or the literal string.
    pub text: String,
    /// The id names a PCI or PCI Express root bus.
    pub pci_bus: bool,
}

/// Derives the identifier used to create the OS device for a node.
///
/// # Errors
/// [`AcpiError::DeviceNotConnected`] when the node has no usable id; the
/// caller skips the child rather than failing the whole bus.
pub fn hardware_id(namespace: &dyn Namespace, node: NodeHandle) -> Result<HardwareId, AcpiError> {
    if namespace.object_type(node) == ObjectType::Processor {
        return Ok(HardwareId {
            text: String::from(PROCESSOR_HARDWARE_ID),
            pci_bus: false,
        });
    }
    let Some(value) = namespace.find_and_evaluate(node, METHOD_HID, &[])? else {
        return Err(AcpiError::DeviceNotConnected);
    };
    match value {
        AcpiValue::Integer(id) => {
            let id = u32::try_from(id).map_err(|_| AcpiError::UnexpectedType)?;
            Ok(HardwareId {
                text: String::from(EisaId::decode(id).as_str()),
                pci_bus: id == EISA_ID_PCI_BUS || id == EISA_ID_PCI_EXPRESS_BUS,
            })
        }
        AcpiValue::String(text) => {
            let pci_bus = text == "PNP0A03" || text == "PNP0A08";
            Ok(HardwareId { text, pci_bus })
        }
        _ => Err(AcpiError::UnexpectedType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedNamespace;

    #[test]
    fn missing_sta_means_fully_functional() {
        let mut namespace = ScriptedNamespace::new();
        let device = namespace.add_device(namespace.system_bus(), *b"DEV0");
        assert_eq!(device_status(&namespace, device), Ok(STA_DEFAULT));
    }

    #[test]
    fn sta_integer_passes_through() {
        let mut namespace = ScriptedNamespace::new();
        let device = namespace.add_device(namespace.system_bus(), *b"DEV0");
        namespace.add_method(device, METHOD_STA, Ok(AcpiValue::Integer(0x0B)));
        assert_eq!(device_status(&namespace, device), Ok(0x0B));
    }

    #[test]
    fn sta_of_the_wrong_type_is_rejected() {
        let mut namespace = ScriptedNamespace::new();
        let device = namespace.add_device(namespace.system_bus(), *b"DEV0");
        namespace.add_method(
            device,
            METHOD_STA,
            Ok(AcpiValue::String(String::from("on"))),
        );
        assert_eq!(
            device_status(&namespace, device),
            Err(AcpiError::UnexpectedType)
        );
    }

    #[test]
    fn processors_use_the_fixed_hardware_id() {
        let mut namespace = ScriptedNamespace::new();
        let processor = namespace.add(namespace.system_bus(), ObjectType::Processor, *b"CPU0");
        let id = hardware_id(&namespace, processor).unwrap();
        assert_eq!(id.text, PROCESSOR_HARDWARE_ID);
        assert!(!id.pci_bus);
    }

    #[test]
    fn eisa_hid_decodes_and_flags_pci_roots() {
        let mut namespace = ScriptedNamespace::new();
        let bus = namespace.add_device(namespace.system_bus(), *b"PCI0");
        namespace.add_method(
            bus,
            METHOD_HID,
            Ok(AcpiValue::Integer(u64::from(EISA_ID_PCI_BUS))),
        );
        let id = hardware_id(&namespace, bus).unwrap();
        assert_eq!(id.text, "PNP0A03");
        assert!(id.pci_bus);
    }

    #[test]
    fn string_hid_passes_through() {
        let mut namespace = ScriptedNamespace::new();
        let device = namespace.add_device(namespace.system_bus(), *b"XHC0");
        namespace.add_method(
            device,
            METHOD_HID,
            Ok(AcpiValue::String(String::from("PNP0A08"))),
        );
        let id = hardware_id(&namespace, device).unwrap();
        assert_eq!(id.text, "PNP0A08");
        assert!(id.pci_bus);
    }

    #[test]
    fn missing_hid_reports_not_connected() {
        let mut namespace = ScriptedNamespace::new();
        let device = namespace.add_device(namespace.system_bus(), *b"DEV0");
        assert_eq!(
            hardware_id(&namespace, device),
            Err(AcpiError::DeviceNotConnected)
        );
    }

    #[test]
    fn insert_is_idempotent_per_node() {
        let mut store = DeviceStore::new();
        let first = store.insert(DeviceContext::new(
            NodeHandle(7),
            OsDevice(1),
            None,
            Role::BusDriver,
        ));
        let second = store.insert(DeviceContext::new(
            NodeHandle(7),
            OsDevice(1),
            None,
            Role::BusDriver,
        ));
        assert_eq!(first, second);
        assert_eq!(store.context_of_node(NodeHandle(7)), Some(first));
        assert_eq!(store.context_of_device(OsDevice(1)), Some(first));
    }

    #[test]
    fn dependencies_drain_once_per_provider() {
        let mut store = DeviceStore::new();
        store.add_dependency(OsDevice(10), NodeHandle(3)).unwrap();
        store.add_dependency(OsDevice(10), NodeHandle(3)).unwrap();
        store.add_dependency(OsDevice(11), NodeHandle(3)).unwrap();
        store.add_dependency(OsDevice(12), NodeHandle(4)).unwrap();

        assert_eq!(
            store.take_dependents(NodeHandle(3)),
            [OsDevice(10), OsDevice(11)]
        );
        assert!(store.take_dependents(NodeHandle(3)).is_empty());
        assert_eq!(store.dependency_count(), 1);
    }

    #[test]
    fn started_provider_rejects_new_dependencies() {
        let mut store = DeviceStore::new();
        let id = store.insert(DeviceContext::new(
            NodeHandle(3),
            OsDevice(1),
            None,
            Role::BusDriver,
        ));
        store.get_mut(id).started = true;

        assert_eq!(
            store.add_dependency(OsDevice(10), NodeHandle(3)),
            Err(AcpiError::TooLate)
        );
        assert_eq!(store.dependency_count(), 0);
    }
}
