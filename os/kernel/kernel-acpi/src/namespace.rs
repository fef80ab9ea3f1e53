//! # ACPI Namespace Access
//!
//! The platform driver walks devices and evaluates control methods, but it
//! does not interpret AML itself. Everything it needs from the interpreter
//! goes through the [`Namespace`] trait: handle-based navigation plus an
//! `evaluate` entry point that returns plain [`AcpiValue`]s.
//!
//! Handles are opaque and stable for the lifetime of the namespace. The
//! driver never holds spin locks across [`Namespace::evaluate`]; method
//! execution may allocate, fault, and take arbitrarily long.

use alloc::string::String;
use alloc::vec::Vec;

use crate::AcpiError;

/// Opaque handle to a namespace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHandle(pub u32);

/// Kind of object a namespace node names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Device,
    Processor,
    Method,
    Integer,
    String,
    Buffer,
    Package,
    /// Anything the driver has no use for (fields, events, mutexes, …).
    Other,
}

/// Result of evaluating a namespace object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcpiValue {
    Integer(u64),
    String(String),
    Buffer(Vec<u8>),
    Package(Vec<AcpiValue>),
    /// Reference to another namespace node.
    Reference(NodeHandle),
}

impl AcpiValue {
    #[must_use]
    pub const fn as_integer(&self) -> Option<u64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_buffer(&self) -> Option<&[u8]> {
        match self {
            Self::Buffer(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_package(&self) -> Option<&[Self]> {
        match self {
            Self::Package(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_reference(&self) -> Option<NodeHandle> {
        match self {
            Self::Reference(node) => Some(*node),
            _ => None,
        }
    }
}

/// The fixed block declared by a `Processor` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorDeclaration {
    /// ACPI processor identifier, matched against the MADT.
    pub processor_id: u32,
    /// I/O port of the processor control block, zero when absent.
    pub block_address: u32,
    /// Length of the control block in bytes.
    pub block_length: u8,
}

/// Navigation and evaluation services of the AML interpreter.
pub trait Namespace: Sync {
    /// The namespace root (`\`).
    fn root(&self) -> NodeHandle;

    /// The system bus scope (`\_SB`).
    fn system_bus(&self) -> NodeHandle;

    /// Type of the object the node names.
    fn object_type(&self, node: NodeHandle) -> ObjectType;

    /// Four-character name segment of the node.
    fn name(&self, node: NodeHandle) -> [u8; 4];

    /// Direct children of the node, in declaration order.
    fn children(&self, node: NodeHandle) -> Vec<NodeHandle>;

    /// Child of `parent` with the given name segment, if any.
    fn find_child(&self, parent: NodeHandle, name: [u8; 4]) -> Option<NodeHandle>;

    /// Resolves a namespace path string (`\`, `^`, and search-parent rules
    /// included) starting from `from`.
    fn resolve_path(&self, from: NodeHandle, path: &str) -> Option<NodeHandle>;

    /// Executes the object and returns its value. Plain data objects
    /// evaluate to themselves.
    ///
    /// # Errors
    /// Whatever the interpreter reports; the driver maps absence of the
    /// object separately via [`Namespace::find_child`].
    fn evaluate(&self, node: NodeHandle, args: &[AcpiValue]) -> Result<AcpiValue, AcpiError>;

    /// Declaration details when the node is a `Processor` statement.
    fn processor_declaration(&self, node: NodeHandle) -> Option<ProcessorDeclaration>;

    /// Evaluates the named child of `node` when it exists.
    ///
    /// # Errors
    /// Evaluation failures pass through; a missing child is `Ok(None)`.
    fn find_and_evaluate(
        &self,
        node: NodeHandle,
        name: [u8; 4],
        args: &[AcpiValue],
    ) -> Result<Option<AcpiValue>, AcpiError> {
        match self.find_child(node, name) {
            Some(child) => self.evaluate(child, args).map(Some),
            None => Ok(None),
        }
    }
}

/// `_ADR`, the address of a device on its parent bus.
pub const METHOD_ADR: [u8; 4] = *b"_ADR";
/// `_HID`, the hardware identifier of a device.
pub const METHOD_HID: [u8; 4] = *b"_HID";
/// `_STA`, the device status word.
pub const METHOD_STA: [u8; 4] = *b"_STA";
/// `_CRS`, the current resource settings buffer.
pub const METHOD_CRS: [u8; 4] = *b"_CRS";
/// `_PRS`, the possible resource settings buffer.
pub const METHOD_PRS: [u8; 4] = *b"_PRS";
/// `_SRS`, the set resource settings control method.
pub const METHOD_SRS: [u8; 4] = *b"_SRS";
/// `_PRT`, the PCI interrupt routing table.
pub const METHOD_PRT: [u8; 4] = *b"_PRT";
/// `_CST`, the processor C-state package.
pub const METHOD_CST: [u8; 4] = *b"_CST";
/// `_TTS`, the transition-to-state notification method.
pub const METHOD_TTS: [u8; 4] = *b"_TTS";
/// `_PTS`, the prepare-to-sleep notification method.
pub const METHOD_PTS: [u8; 4] = *b"_PTS";

/// Name of the `_Sx` package for a sleep state, `_S0_` through `_S5_`.
#[must_use]
pub const fn sleep_state_name(state: u8) -> [u8; 4] {
    debug_assert!(state <= 5);
    [b'_', b'S', b'0' + state, b'_']
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_state_names() {
        assert_eq!(sleep_state_name(0), *b"_S0_");
        assert_eq!(sleep_state_name(5), *b"_S5_");
    }

    #[test]
    fn value_accessors() {
        assert_eq!(AcpiValue::Integer(7).as_integer(), Some(7));
        assert_eq!(AcpiValue::Integer(7).as_buffer(), None);
        let value = AcpiValue::Package(alloc::vec![AcpiValue::Integer(1)]);
        assert_eq!(value.as_package().map(<[AcpiValue]>::len), Some(1));
        assert_eq!(
            AcpiValue::Reference(NodeHandle(3)).as_reference(),
            Some(NodeHandle(3))
        );
    }
}
