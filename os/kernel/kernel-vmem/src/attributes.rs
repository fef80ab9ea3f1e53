use bitfield_struct::bitfield;

/// Architecture-neutral mapping attributes.
///
/// This is the caller-facing vocabulary for [`crate::AddressSpace`]
/// operations; [`crate::PageEntry`] translates it into hardware bits.
/// Note the polarity differences against x86-64: callers say `read_only`
/// and `execute`, the hardware says `RW` and `NX`.
#[bitfield(u16, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct MapAttributes {
    /// Deny writes.
    pub read_only: bool,

    /// Allow user-mode access.
    pub user: bool,

    /// Write-through caching.
    pub write_through: bool,

    /// Disable caching entirely (device memory).
    pub cache_disable: bool,

    /// Keep the translation across address-space switches.
    pub global: bool,

    /// Allow instruction fetch.
    pub execute: bool,

    /// Map as 2 MiB pages. Base and size must be 2 MiB aligned.
    pub large: bool,

    #[bits(9, default = 0)]
    _reserved: u16,
}

/// A masked attribute change: only bits set in `mask` take effect.
///
/// The packed form carries the new values in the low half and the mask in
/// the high half of a `u32`, so a single word describes both which
/// attributes change and what they change to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeUpdate {
    value: MapAttributes,
    mask: MapAttributes,
}

impl AttributeUpdate {
    /// Change `mask` attributes to the state given in `value`.
    #[inline]
    #[must_use]
    pub const fn new(value: MapAttributes, mask: MapAttributes) -> Self {
        Self { value, mask }
    }

    /// Decode from the packed wire form: bits 15:0 are values, bits 31:16
    /// select which of them apply.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_packed(packed: u32) -> Self {
        Self {
            value: MapAttributes::from_bits(packed as u16),
            mask: MapAttributes::from_bits((packed >> 16) as u16),
        }
    }

    /// Re-encode into the packed wire form.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn into_packed(self) -> u32 {
        ((self.mask.into_bits() as u32) << 16) | (self.value.into_bits() as u32)
    }

    /// Apply to an existing attribute set, leaving unmasked bits alone.
    #[inline]
    #[must_use]
    pub const fn apply(self, current: MapAttributes) -> MapAttributes {
        let kept = current.into_bits() & !self.mask.into_bits();
        let changed = self.value.into_bits() & self.mask.into_bits();
        MapAttributes::from_bits(kept | changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_only_touches_masked_bits() {
        let current = MapAttributes::new().with_read_only(true).with_global(true);
        let update = AttributeUpdate::new(
            MapAttributes::new().with_read_only(false).with_user(true),
            MapAttributes::new().with_read_only(true).with_user(true),
        );

        let next = update.apply(current);
        assert!(!next.read_only(), "masked bit flips");
        assert!(next.user(), "masked bit sets");
        assert!(next.global(), "unmasked bit survives");
    }

    #[test]
    fn packed_round_trip() {
        let update = AttributeUpdate::new(
            MapAttributes::new().with_cache_disable(true),
            MapAttributes::new()
                .with_cache_disable(true)
                .with_write_through(true),
        );
        assert_eq!(AttributeUpdate::from_packed(update.into_packed()), update);
    }

    #[test]
    fn empty_mask_is_identity() {
        let current = MapAttributes::new().with_execute(true);
        let update = AttributeUpdate::from_packed(0x0000_FFFF);
        assert_eq!(update.apply(current), current);
    }
}
