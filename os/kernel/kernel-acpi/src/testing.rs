//! Shared test fakes: a scripted kernel-services implementation, a
//! synthetic FADT builder, and a hand-built namespace.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kernel_acpi_tables::fadt::{Fadt, FADT_SIGNATURE};
use kernel_acpi_tables::header::{DescriptionHeader, GenericAddress};
use kernel_sync::SpinMutex;

use crate::cstates::IdleState;
use crate::device::{DeviceOps, OsDevice};
use crate::namespace::{AcpiValue, Namespace, NodeHandle, ObjectType, ProcessorDeclaration};
use crate::requirements::Allocation;
use crate::{AcpiError, SystemOps};

/// A port write that, once it happens, overrides the value read from
/// another port. Models firmware reacting to SMI commands.
pub struct WriteRule {
    pub port: u16,
    pub value: u32,
    pub then_port: u16,
    pub then_value: u32,
}

/// Scripted [`SystemOps`]: an in-memory port space, leaked page buffers
/// standing in for physical mappings, and a tick counter that only
/// advances through `delay_ms`. One tick is one millisecond.
pub struct TestSystem {
    ticks: AtomicU64,
    map_fail: AtomicBool,
    pub ports: SpinMutex<BTreeMap<u16, u32>>,
    pub port_writes: SpinMutex<Vec<(u16, u32)>>,
    pub rules: SpinMutex<Vec<WriteRule>>,
    pages: SpinMutex<BTreeMap<u64, usize>>,
    pub idle_states: SpinMutex<Vec<Vec<IdleState>>>,
    pub boot_processor_runs: AtomicU64,
}

impl TestSystem {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            map_fail: AtomicBool::new(false),
            ports: SpinMutex::new(BTreeMap::new()),
            port_writes: SpinMutex::new(Vec::new()),
            rules: SpinMutex::new(Vec::new()),
            pages: SpinMutex::new(BTreeMap::new()),
            idle_states: SpinMutex::new(Vec::new()),
            boot_processor_runs: AtomicU64::new(0),
        }
    }

    pub fn set_port(&self, port: u16, value: u32) {
        self.ports.lock().insert(port, value);
    }

    pub fn fail_mappings(&self, fail: bool) {
        self.map_fail.store(fail, Ordering::Relaxed);
    }

    /// The leaked buffer standing in for the page mapped at `address`.
    /// The same address always yields the same buffer.
    fn page_buffer(&self, address: u64) -> *mut u8 {
        let mut pages = self.pages.lock();
        let base = *pages.entry(address).or_insert_with(|| {
            let buffer = alloc::vec![0_u8; 4096].into_boxed_slice();
            alloc::boxed::Box::leak(buffer).as_mut_ptr() as usize
        });
        base as *mut u8
    }

    /// Seeds bytes into the buffer a driver-side page-aligned mapping of
    /// `address` will see.
    pub fn write_physical(&self, address: u64, bytes: &[u8]) {
        let page = self.page_buffer(address & !0xFFF);
        let offset = (address & 0xFFF) as usize;
        assert!(offset + bytes.len() <= 4096);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), page.add(offset), bytes.len());
        }
    }

    pub fn read_physical(&self, address: u64, length: usize) -> Vec<u8> {
        let page = self.page_buffer(address & !0xFFF);
        let offset = (address & 0xFFF) as usize;
        assert!(offset + length <= 4096);
        let mut bytes = alloc::vec![0_u8; length];
        unsafe {
            core::ptr::copy_nonoverlapping(page.add(offset), bytes.as_mut_ptr(), length);
        }
        bytes
    }
}

impl Default for TestSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemOps for TestSystem {
    fn time_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn ticks_per_second(&self) -> u64 {
        1000
    }

    fn delay_ms(&self, milliseconds: u64) {
        self.ticks.fetch_add(milliseconds, Ordering::Relaxed);
    }

    fn run_on_boot_processor(&self, work: &mut dyn FnMut()) {
        self.boot_processor_runs.fetch_add(1, Ordering::Relaxed);
        work();
    }

    fn fatal(&self, message: &'static str, detail: u64) -> ! {
        panic!("fatal {detail:#x}: {message}");
    }

    fn io_read(&self, port: u16, _width: usize) -> u32 {
        self.ports.lock().get(&port).copied().unwrap_or(0)
    }

    fn io_write(&self, port: u16, _width: usize, value: u32) {
        self.port_writes.lock().push((port, value));
        self.ports.lock().insert(port, value);
        let rules = self.rules.lock();
        for rule in rules.iter() {
            if rule.port == port && rule.value == value {
                self.ports.lock().insert(rule.then_port, rule.then_value);
            }
        }
    }

    fn map_physical(&self, address: u64, length: usize) -> Option<NonNull<u8>> {
        if self.map_fail.load(Ordering::Relaxed) {
            return None;
        }
        assert!(length <= 4096, "test mappings are single pages");
        NonNull::new(self.page_buffer(address))
    }

    fn register_idle_states(&self, states: &[IdleState]) {
        self.idle_states.lock().push(states.to_vec());
    }
}

/// A fully zeroed FADT with a valid header, adjusted by `fill`.
pub fn fadt_with(fill: impl FnOnce(&mut Fadt)) -> Fadt {
    let mut fadt = Fadt {
        header: DescriptionHeader {
            signature: FADT_SIGNATURE,
            length: u32::try_from(size_of::<Fadt>()).unwrap(),
            revision: 5,
            checksum: 0,
            oem_id: *b"FERRIT",
            oem_table_id: 0,
            oem_revision: 0,
            creator_id: 0,
            creator_revision: 0,
        },
        firmware_control: 0,
        dsdt: 0,
        reserved1: 0,
        preferred_power_profile: 0,
        sci_vector: 9,
        smi_command_port: 0,
        acpi_enable: 0,
        acpi_disable: 0,
        s4_bios_request: 0,
        pstate_control: 0,
        pm1a_event_block: 0,
        pm1b_event_block: 0,
        pm1a_control_block: 0,
        pm1b_control_block: 0,
        pm2_control_block: 0,
        pm_timer_block: 0,
        gpe0_block: 0,
        gpe1_block: 0,
        pm1_event_length: 0,
        pm1_control_length: 0,
        pm2_control_length: 0,
        pm_timer_length: 0,
        gpe0_block_length: 0,
        gpe1_block_length: 0,
        gpe1_base: 0,
        cst_control: 0,
        c2_latency: 0,
        c3_latency: 0,
        flush_size: 0,
        flush_stride: 0,
        duty_offset: 0,
        duty_width: 0,
        day_alarm: 0,
        month_alarm: 0,
        century: 0,
        ia_boot_flags: 0,
        reserved2: 0,
        flags: 0,
        reset_register: GenericAddress::EMPTY,
        reset_value: 0,
        reserved3: [0; 3],
        x_firmware_control: 0,
        x_dsdt: 0,
        x_pm1a_event_block: GenericAddress::EMPTY,
        x_pm1b_event_block: GenericAddress::EMPTY,
        x_pm1a_control_block: GenericAddress::EMPTY,
        x_pm1b_control_block: GenericAddress::EMPTY,
        x_pm2_control_block: GenericAddress::EMPTY,
        x_pm_timer_block: GenericAddress::EMPTY,
        x_gpe0_block: GenericAddress::EMPTY,
        x_gpe1_block: GenericAddress::EMPTY,
    };
    fill(&mut fadt);
    fadt
}

/// Scripted [`DeviceOps`]: handles are created sequentially from 100,
/// and every interaction is recorded for assertions.
pub struct TestDevices {
    next: AtomicU64,
    pub created: SpinMutex<Vec<(OsDevice, String, OsDevice)>>,
    pub restarted: SpinMutex<Vec<OsDevice>>,
    pub allocations: SpinMutex<BTreeMap<OsDevice, Vec<Allocation>>>,
    pub bus_addresses: SpinMutex<BTreeMap<OsDevice, u64>>,
    pub children: SpinMutex<BTreeMap<OsDevice, Vec<OsDevice>>>,
    pub bridges: SpinMutex<BTreeSet<OsDevice>>,
    pub fail_create: AtomicBool,
}

impl TestDevices {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(100),
            created: SpinMutex::new(Vec::new()),
            restarted: SpinMutex::new(Vec::new()),
            allocations: SpinMutex::new(BTreeMap::new()),
            bus_addresses: SpinMutex::new(BTreeMap::new()),
            children: SpinMutex::new(BTreeMap::new()),
            bridges: SpinMutex::new(BTreeSet::new()),
            fail_create: AtomicBool::new(false),
        }
    }
}

impl Default for TestDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceOps for TestDevices {
    fn create_device(&self, parent: OsDevice, hardware_id: &str) -> Result<OsDevice, AcpiError> {
        if self.fail_create.load(Ordering::Relaxed) {
            return Err(AcpiError::InsufficientResources);
        }
        let device = OsDevice(self.next.fetch_add(1, Ordering::Relaxed));
        self.created
            .lock()
            .push((parent, String::from(hardware_id), device));
        Ok(device)
    }

    fn restart_device(&self, device: OsDevice) {
        self.restarted.lock().push(device);
    }

    fn allocations(&self, device: OsDevice) -> Vec<Allocation> {
        self.allocations
            .lock()
            .get(&device)
            .cloned()
            .unwrap_or_default()
    }

    fn bus_address(&self, device: OsDevice) -> Option<u64> {
        self.bus_addresses.lock().get(&device).copied()
    }

    fn reported_children(&self, bus: OsDevice) -> Vec<OsDevice> {
        self.children.lock().get(&bus).cloned().unwrap_or_default()
    }

    fn is_pci_bridge(&self, device: OsDevice) -> bool {
        self.bridges.lock().contains(&device)
    }
}

struct NodeSpec {
    name: [u8; 4],
    object_type: ObjectType,
    parent: Option<NodeHandle>,
    children: Vec<NodeHandle>,
    value: Option<Result<AcpiValue, AcpiError>>,
    processor: Option<ProcessorDeclaration>,
}

/// Hand-built namespace tree. Construction is single-threaded through
/// `&mut self`; afterwards the tree is immutable and only the evaluation
/// log changes.
pub struct ScriptedNamespace {
    nodes: Vec<NodeSpec>,
    pub evaluations: SpinMutex<Vec<(NodeHandle, Vec<AcpiValue>)>>,
}

fn idx(node: NodeHandle) -> usize {
    usize::try_from(node.0).unwrap()
}

impl ScriptedNamespace {
    /// A namespace holding the root and `\_SB_`.
    pub fn new() -> Self {
        let mut namespace = Self {
            nodes: Vec::new(),
            evaluations: SpinMutex::new(Vec::new()),
        };
        namespace.nodes.push(NodeSpec {
            name: *b"\\___",
            object_type: ObjectType::Other,
            parent: None,
            children: Vec::new(),
            value: None,
            processor: None,
        });
        let root = NodeHandle(0);
        namespace.add(root, ObjectType::Device, *b"_SB_");
        namespace
    }

    pub fn add(&mut self, parent: NodeHandle, object_type: ObjectType, name: [u8; 4]) -> NodeHandle {
        let handle = NodeHandle(u32::try_from(self.nodes.len()).unwrap());
        self.nodes.push(NodeSpec {
            name,
            object_type,
            parent: Some(parent),
            children: Vec::new(),
            value: None,
            processor: None,
        });
        self.nodes[idx(parent)].children.push(handle);
        handle
    }

    pub fn add_device(&mut self, parent: NodeHandle, name: [u8; 4]) -> NodeHandle {
        self.add(parent, ObjectType::Device, name)
    }

    pub fn add_processor(
        &mut self,
        parent: NodeHandle,
        name: [u8; 4],
        declaration: ProcessorDeclaration,
    ) -> NodeHandle {
        let handle = self.add(parent, ObjectType::Processor, name);
        self.nodes[idx(handle)].processor = Some(declaration);
        handle
    }

    /// Adds a method child whose evaluation yields `result`.
    pub fn add_method(
        &mut self,
        parent: NodeHandle,
        name: [u8; 4],
        result: Result<AcpiValue, AcpiError>,
    ) -> NodeHandle {
        let handle = self.add(parent, ObjectType::Method, name);
        self.nodes[idx(handle)].value = Some(result);
        handle
    }

    /// Replaces the scripted result of an existing method node.
    pub fn set_result(&mut self, method: NodeHandle, result: Result<AcpiValue, AcpiError>) {
        self.nodes[idx(method)].value = Some(result);
    }

    fn parent(&self, node: NodeHandle) -> Option<NodeHandle> {
        self.nodes[idx(node)].parent
    }

    /// Arguments of the `index`-th evaluation of `method`, for assertions
    /// on `_SRS`-style calls.
    pub fn arguments(&self, method: NodeHandle, index: usize) -> Option<Vec<AcpiValue>> {
        self.evaluations
            .lock()
            .iter()
            .filter(|(node, _)| *node == method)
            .nth(index)
            .map(|(_, args)| args.clone())
    }

    pub fn evaluation_count(&self, method: NodeHandle) -> usize {
        self.evaluations
            .lock()
            .iter()
            .filter(|(node, _)| *node == method)
            .count()
    }
}

impl Default for ScriptedNamespace {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads a path segment to the fixed four-character ACPI name.
fn pad_name(segment: &str) -> [u8; 4] {
    let mut name = [b'_'; 4];
    for (slot, byte) in name.iter_mut().zip(segment.bytes()) {
        *slot = byte;
    }
    name
}

impl Namespace for ScriptedNamespace {
    fn root(&self) -> NodeHandle {
        NodeHandle(0)
    }

    fn system_bus(&self) -> NodeHandle {
        NodeHandle(1)
    }

    fn object_type(&self, node: NodeHandle) -> ObjectType {
        self.nodes[idx(node)].object_type
    }

    fn name(&self, node: NodeHandle) -> [u8; 4] {
        self.nodes[idx(node)].name
    }

    fn children(&self, node: NodeHandle) -> Vec<NodeHandle> {
        self.nodes[idx(node)].children.clone()
    }

    fn find_child(&self, parent: NodeHandle, name: [u8; 4]) -> Option<NodeHandle> {
        self.nodes[idx(parent)]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[idx(child)].name == name)
    }

    fn resolve_path(&self, from: NodeHandle, path: &str) -> Option<NodeHandle> {
        let rooted = path.starts_with('\\') || path.starts_with('^');
        let mut rest = path;
        let mut node = if let Some(stripped) = rest.strip_prefix('\\') {
            rest = stripped;
            self.root()
        } else {
            let mut start = from;
            while let Some(stripped) = rest.strip_prefix('^') {
                rest = stripped;
                start = self.parent(start)?;
            }
            start
        };
        if rest.is_empty() {
            return Some(node);
        }
        let segments: Vec<[u8; 4]> = rest.split('.').map(pad_name).collect();

        // A bare single name searches enclosing scopes up to the root.
        if !rooted && segments.len() == 1 {
            let mut scope = Some(from);
            while let Some(current) = scope {
                if let Some(found) = self.find_child(current, segments[0]) {
                    return Some(found);
                }
                scope = self.parent(current);
            }
            return None;
        }
        for segment in segments {
            node = self.find_child(node, segment)?;
        }
        Some(node)
    }

    fn evaluate(&self, node: NodeHandle, args: &[AcpiValue]) -> Result<AcpiValue, AcpiError> {
        self.evaluations.lock().push((node, args.to_vec()));
        self.nodes[idx(node)]
            .value
            .clone()
            .unwrap_or(Err(AcpiError::NotFound))
    }

    fn processor_declaration(&self, node: NodeHandle) -> Option<ProcessorDeclaration> {
        self.nodes[idx(node)].processor
    }
}
