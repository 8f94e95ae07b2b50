// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chained pointer formats and their wire layouts.
//!
//! dyld encodes rebase and bind information inside the pointer words
//! themselves, using one of a dozen bit-packed layouts selected per segment
//! by the starts table. The layouts differ in word size, the multiplier
//! applied to the `next` field (the stride), whether rebase targets are vm
//! addresses or offsets from the preferred load address, and whether ARM64e
//! pointer authentication metadata is carried.
//!
//! This module is the catalog: every decoding path derives field positions
//! from the [BitLayout] published here and nowhere else. The layouts mirror
//! the packed structs in Apple's `<mach-o/fixup-chains.h>`.

use crate::error::MachoIntrospectError;

/// A contiguous range of bits within a pointer word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitRange {
    /// Bit position of the least significant bit of the field.
    pub start: u8,
    /// Number of bits in the field.
    pub width: u8,
}

impl BitRange {
    pub const fn new(start: u8, width: u8) -> Self {
        Self { start, width }
    }

    /// Extract the field from a word as an unsigned value.
    pub fn extract(&self, word: u64) -> u64 {
        (word >> self.start) & ((1u64 << self.width) - 1)
    }

    /// Extract the field and sign-extend it at the declared width.
    pub fn extract_signed(&self, word: u64) -> i64 {
        sign_extend(self.extract(word), self.width)
    }
}

/// Sign-extend `value`, a `width`-bit quantity, to 64 bits.
///
/// If the top bit at the declared width is set, it is replicated into
/// every bit above the width.
pub fn sign_extend(value: u64, width: u8) -> i64 {
    debug_assert!(width > 0 && width < 64);

    if value & (1u64 << (width - 1)) != 0 {
        (value | !((1u64 << width) - 1)) as i64
    } else {
        value as i64
    }
}

/// Field positions for every quantity a chained pointer can carry.
///
/// Fields absent from a format are `None`. The plain-rebase target and the
/// authenticated target are distinct ranges because ARM64e narrows the
/// target to 32 bits when authentication metadata occupies the upper half.
#[derive(Clone, Copy, Debug)]
pub struct BitLayout {
    /// Rebase target (vm address or offset, per the format).
    pub target: BitRange,
    /// Top byte of the target pointer, carried out of line.
    pub high8: Option<BitRange>,
    /// Offset to the next chain entry, in strides.
    pub next: BitRange,
    /// Set when the word encodes a bind.
    pub bind_flag: Option<BitRange>,
    /// Set when the word carries authentication metadata.
    pub auth_flag: Option<BitRange>,
    /// Bind import ordinal.
    pub ordinal: Option<BitRange>,
    /// Inline bind addend.
    pub addend: Option<BitRange>,
    /// Rebase target when the auth flag is set.
    pub auth_target: Option<BitRange>,
    /// Pointer authentication extra discriminator.
    pub diversity: Option<BitRange>,
    /// Set when the location address is blended into the discriminator.
    pub addr_div: Option<BitRange>,
    /// Pointer authentication key selector.
    pub key: Option<BitRange>,
    /// Kernel collection level for kernel-cache formats.
    pub cache_level: Option<BitRange>,
}

/// Static description of one pointer format.
#[derive(Clone, Copy, Debug)]
pub struct PointerFormatInfo {
    /// Size in bytes of one chain entry.
    pub word_size: u8,
    /// Multiplier applied to `next` to advance along the chain, in bytes.
    pub stride: u8,
    /// Whether rebase targets are vm addresses that must be rebased against
    /// the preferred load address, as opposed to offsets passed through.
    pub rebase_target_is_vm_addr: bool,
    /// Whether the format can carry ARM64e authentication metadata.
    pub auth_capable: bool,
    /// Width in bits of the bind ordinal field. 0 when binds are not
    /// expressible in this format.
    pub bind_ordinal_width: u8,
    /// Width in bits of the inline bind addend field.
    pub bind_addend_width: u8,
    /// Whether the inline addend is sign-extended at its width.
    pub bind_addend_signed: bool,
    /// Field positions.
    pub layout: BitLayout,
}

impl PointerFormatInfo {
    /// Whether the format can express binds at all.
    pub fn bind_capable(&self) -> bool {
        self.bind_ordinal_width > 0
    }
}

/// The `DYLD_CHAINED_PTR_*` pointer format discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PointerFormat {
    /// Authenticated arm64e, target is a vm address. Stride 8.
    Arm64e = 1,
    /// Generic 64-bit, target is a vm address. Stride 4.
    Ptr64 = 2,
    /// Generic 32-bit, target is a vm address. Stride 4.
    Ptr32 = 3,
    /// 32-bit shared cache, rebase only. Stride 4.
    Ptr32Cache = 4,
    /// 32-bit firmware, rebase only. Stride 4.
    Ptr32Firmware = 5,
    /// Generic 64-bit, target is an offset from the load address. Stride 4.
    Ptr64Offset = 6,
    /// Authenticated arm64e kernel, target is an offset. Stride 4.
    Arm64eKernel = 7,
    /// 64-bit kernel collection, rebase only. Stride 4.
    Ptr64KernelCache = 8,
    /// Authenticated arm64e userland, target is an offset. Stride 8.
    Arm64eUserland = 9,
    /// Authenticated arm64e firmware, target is a vm address. Stride 4.
    Arm64eFirmware = 10,
    /// x86-64 kernel collection, rebase only. Stride 1.
    X86_64KernelCache = 11,
    /// Arm64e userland with 24-bit bind ordinals. Stride 8.
    Arm64eUserland24 = 12,
}

impl TryFrom<u16> for PointerFormat {
    type Error = MachoIntrospectError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Arm64e),
            2 => Ok(Self::Ptr64),
            3 => Ok(Self::Ptr32),
            4 => Ok(Self::Ptr32Cache),
            5 => Ok(Self::Ptr32Firmware),
            6 => Ok(Self::Ptr64Offset),
            7 => Ok(Self::Arm64eKernel),
            8 => Ok(Self::Ptr64KernelCache),
            9 => Ok(Self::Arm64eUserland),
            10 => Ok(Self::Arm64eFirmware),
            11 => Ok(Self::X86_64KernelCache),
            12 => Ok(Self::Arm64eUserland24),
            _ => Err(MachoIntrospectError::UnknownPointerFormat(v)),
        }
    }
}

impl From<PointerFormat> for u16 {
    fn from(v: PointerFormat) -> u16 {
        v as u16
    }
}

impl std::fmt::Display for PointerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Arm64e => "DYLD_CHAINED_PTR_ARM64E",
            Self::Ptr64 => "DYLD_CHAINED_PTR_64",
            Self::Ptr32 => "DYLD_CHAINED_PTR_32",
            Self::Ptr32Cache => "DYLD_CHAINED_PTR_32_CACHE",
            Self::Ptr32Firmware => "DYLD_CHAINED_PTR_32_FIRMWARE",
            Self::Ptr64Offset => "DYLD_CHAINED_PTR_64_OFFSET",
            Self::Arm64eKernel => "DYLD_CHAINED_PTR_ARM64E_KERNEL",
            Self::Ptr64KernelCache => "DYLD_CHAINED_PTR_64_KERNEL_CACHE",
            Self::Arm64eUserland => "DYLD_CHAINED_PTR_ARM64E_USERLAND",
            Self::Arm64eFirmware => "DYLD_CHAINED_PTR_ARM64E_FIRMWARE",
            Self::X86_64KernelCache => "DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE",
            Self::Arm64eUserland24 => "DYLD_CHAINED_PTR_ARM64E_USERLAND24",
        };

        f.write_str(name)
    }
}

/// Layout shared by the arm64e family. 16-bit bind ordinals.
const ARM64E_LAYOUT: BitLayout = BitLayout {
    target: BitRange::new(0, 43),
    high8: Some(BitRange::new(43, 8)),
    next: BitRange::new(51, 11),
    bind_flag: Some(BitRange::new(62, 1)),
    auth_flag: Some(BitRange::new(63, 1)),
    ordinal: Some(BitRange::new(0, 16)),
    addend: Some(BitRange::new(32, 19)),
    auth_target: Some(BitRange::new(0, 32)),
    diversity: Some(BitRange::new(32, 16)),
    addr_div: Some(BitRange::new(48, 1)),
    key: Some(BitRange::new(49, 2)),
    cache_level: None,
};

/// Arm64e with 24-bit bind ordinals.
const ARM64E_24_LAYOUT: BitLayout = BitLayout {
    ordinal: Some(BitRange::new(0, 24)),
    ..ARM64E_LAYOUT
};

/// Generic 64-bit layout (vm address and offset target flavors).
const PTR64_LAYOUT: BitLayout = BitLayout {
    target: BitRange::new(0, 36),
    high8: Some(BitRange::new(36, 8)),
    next: BitRange::new(51, 12),
    bind_flag: Some(BitRange::new(63, 1)),
    auth_flag: None,
    ordinal: Some(BitRange::new(0, 24)),
    addend: Some(BitRange::new(24, 8)),
    auth_target: None,
    diversity: None,
    addr_div: None,
    key: None,
    cache_level: None,
};

/// 64-bit kernel collection layout. The auth fields are always present in
/// the word; the auth flag selects whether they are meaningful.
const KERNEL_CACHE_LAYOUT: BitLayout = BitLayout {
    target: BitRange::new(0, 30),
    high8: None,
    next: BitRange::new(51, 12),
    bind_flag: None,
    auth_flag: Some(BitRange::new(63, 1)),
    ordinal: None,
    addend: None,
    auth_target: Some(BitRange::new(0, 30)),
    diversity: Some(BitRange::new(32, 16)),
    addr_div: Some(BitRange::new(48, 1)),
    key: Some(BitRange::new(49, 2)),
    cache_level: Some(BitRange::new(30, 2)),
};

const PTR32_LAYOUT: BitLayout = BitLayout {
    target: BitRange::new(0, 26),
    high8: None,
    next: BitRange::new(26, 5),
    bind_flag: Some(BitRange::new(31, 1)),
    auth_flag: None,
    ordinal: Some(BitRange::new(0, 20)),
    addend: Some(BitRange::new(20, 6)),
    auth_target: None,
    diversity: None,
    addr_div: None,
    key: None,
    cache_level: None,
};

const PTR32_CACHE_LAYOUT: BitLayout = BitLayout {
    target: BitRange::new(0, 30),
    high8: None,
    next: BitRange::new(30, 2),
    bind_flag: None,
    auth_flag: None,
    ordinal: None,
    addend: None,
    auth_target: None,
    diversity: None,
    addr_div: None,
    key: None,
    cache_level: None,
};

const PTR32_FIRMWARE_LAYOUT: BitLayout = BitLayout {
    target: BitRange::new(0, 26),
    next: BitRange::new(26, 6),
    ..PTR32_CACHE_LAYOUT
};

impl PointerFormat {
    /// Obtain the static description of this format.
    pub fn info(&self) -> &'static PointerFormatInfo {
        match self {
            Self::Arm64e => &PointerFormatInfo {
                word_size: 8,
                stride: 8,
                rebase_target_is_vm_addr: true,
                auth_capable: true,
                bind_ordinal_width: 16,
                bind_addend_width: 19,
                bind_addend_signed: true,
                layout: ARM64E_LAYOUT,
            },
            Self::Ptr64 => &PointerFormatInfo {
                word_size: 8,
                stride: 4,
                rebase_target_is_vm_addr: true,
                auth_capable: false,
                bind_ordinal_width: 24,
                bind_addend_width: 8,
                bind_addend_signed: false,
                layout: PTR64_LAYOUT,
            },
            Self::Ptr32 => &PointerFormatInfo {
                word_size: 4,
                stride: 4,
                rebase_target_is_vm_addr: true,
                auth_capable: false,
                bind_ordinal_width: 20,
                bind_addend_width: 6,
                bind_addend_signed: false,
                layout: PTR32_LAYOUT,
            },
            Self::Ptr32Cache => &PointerFormatInfo {
                word_size: 4,
                stride: 4,
                rebase_target_is_vm_addr: false,
                auth_capable: false,
                bind_ordinal_width: 0,
                bind_addend_width: 0,
                bind_addend_signed: false,
                layout: PTR32_CACHE_LAYOUT,
            },
            Self::Ptr32Firmware => &PointerFormatInfo {
                word_size: 4,
                stride: 4,
                rebase_target_is_vm_addr: true,
                auth_capable: false,
                bind_ordinal_width: 0,
                bind_addend_width: 0,
                bind_addend_signed: false,
                layout: PTR32_FIRMWARE_LAYOUT,
            },
            Self::Ptr64Offset => &PointerFormatInfo {
                word_size: 8,
                stride: 4,
                rebase_target_is_vm_addr: false,
                auth_capable: false,
                bind_ordinal_width: 24,
                bind_addend_width: 8,
                bind_addend_signed: false,
                layout: PTR64_LAYOUT,
            },
            Self::Arm64eKernel => &PointerFormatInfo {
                word_size: 8,
                stride: 4,
                rebase_target_is_vm_addr: false,
                auth_capable: true,
                bind_ordinal_width: 16,
                bind_addend_width: 19,
                bind_addend_signed: true,
                layout: ARM64E_LAYOUT,
            },
            Self::Ptr64KernelCache => &PointerFormatInfo {
                word_size: 8,
                stride: 4,
                rebase_target_is_vm_addr: false,
                auth_capable: true,
                bind_ordinal_width: 0,
                bind_addend_width: 0,
                bind_addend_signed: false,
                layout: KERNEL_CACHE_LAYOUT,
            },
            Self::Arm64eUserland => &PointerFormatInfo {
                word_size: 8,
                stride: 8,
                rebase_target_is_vm_addr: false,
                auth_capable: true,
                bind_ordinal_width: 16,
                bind_addend_width: 19,
                bind_addend_signed: true,
                layout: ARM64E_LAYOUT,
            },
            Self::Arm64eFirmware => &PointerFormatInfo {
                word_size: 8,
                stride: 4,
                rebase_target_is_vm_addr: true,
                auth_capable: true,
                bind_ordinal_width: 16,
                bind_addend_width: 19,
                bind_addend_signed: true,
                layout: ARM64E_LAYOUT,
            },
            Self::X86_64KernelCache => &PointerFormatInfo {
                word_size: 8,
                stride: 1,
                rebase_target_is_vm_addr: false,
                auth_capable: true,
                bind_ordinal_width: 0,
                bind_addend_width: 0,
                bind_addend_signed: false,
                layout: KERNEL_CACHE_LAYOUT,
            },
            Self::Arm64eUserland24 => &PointerFormatInfo {
                word_size: 8,
                stride: 8,
                rebase_target_is_vm_addr: false,
                auth_capable: true,
                bind_ordinal_width: 24,
                bind_addend_width: 19,
                bind_addend_signed: true,
                layout: ARM64E_24_LAYOUT,
            },
        }
    }

    pub fn word_size(&self) -> u8 {
        self.info().word_size
    }

    pub fn stride(&self) -> u8 {
        self.info().stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_range_extract() {
        let r = BitRange::new(8, 4);

        assert_eq!(r.extract(0x0000_0f00), 0xf);
        assert_eq!(r.extract(0xffff_00ff), 0);
    }

    #[test]
    fn sign_extension_19_bit_addend() {
        // Top bit of a 19-bit field replicates upward.
        let value = 0x7_0001u64;
        assert_eq!(
            sign_extend(value, 19) as u64,
            value | 0xffff_ffff_fffc_0000
        );

        // Positive values pass through.
        assert_eq!(sign_extend(3, 19), 3);
        assert_eq!(sign_extend(0x3_ffff, 19), 0x3_ffff);
    }

    #[test]
    fn all_formats_resolve() {
        for raw in 1u16..=12 {
            let format = PointerFormat::try_from(raw).unwrap();
            let info = format.info();

            assert_eq!(u16::from(format), raw);
            assert!(matches!(info.word_size, 4 | 8));
            assert!(matches!(info.stride, 1 | 4 | 8));
            assert_eq!(info.auth_capable, info.layout.auth_flag.is_some());
            assert_eq!(
                info.bind_capable(),
                info.layout.ordinal.is_some(),
                "{format}"
            );
        }

        assert!(matches!(
            PointerFormat::try_from(13),
            Err(MachoIntrospectError::UnknownPointerFormat(13))
        ));
    }

    #[test]
    fn stride_table() {
        assert_eq!(PointerFormat::Arm64e.stride(), 8);
        assert_eq!(PointerFormat::Ptr64.stride(), 4);
        assert_eq!(PointerFormat::X86_64KernelCache.stride(), 1);
        assert_eq!(PointerFormat::Arm64eUserland24.stride(), 8);
    }
}
