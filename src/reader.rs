// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Random-access byte sources and segment maps.
//!
//! The introspection engine never parses Mach-O load commands itself. The
//! outer layer hands it two things: a [ByteSource] rooted at file offset 0
//! and a [SegmentMap] describing where segments live on disk and in memory.
//! Everything else is derived from those.

use crate::error::MachoIntrospectError;

/// A random-access byte source.
///
/// This is a capability set, not an inheritance hierarchy: anything that can
/// service bounded reads at absolute file offsets can back the engine. The
/// common case is a memory-mapped or fully-read binary exposed as a byte
/// slice.
pub trait ByteSource {
    /// Read exactly `length` bytes starting at `offset`.
    ///
    /// Reads extending past the end of the source fail with
    /// [MachoIntrospectError::ReadOutOfBounds] rather than truncating.
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, MachoIntrospectError>;

    /// Total number of bytes available.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ByteSource for [u8] {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, MachoIntrospectError> {
        let end = offset
            .checked_add(length as u64)
            .ok_or(MachoIntrospectError::ReadOutOfBounds {
                offset,
                length,
                size: self.len() as u64,
            })?;

        if end > self.len() as u64 {
            return Err(MachoIntrospectError::ReadOutOfBounds {
                offset,
                length,
                size: self.len() as u64,
            });
        }

        Ok(self[offset as usize..end as usize].to_vec())
    }

    fn len(&self) -> u64 {
        self.as_ref().len() as u64
    }
}

impl<T: ByteSource + ?Sized> ByteSource for &T {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, MachoIntrospectError> {
        (**self).read_at(offset, length)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

impl ByteSource for Vec<u8> {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, MachoIntrospectError> {
        self.as_slice().read_at(offset, length)
    }

    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }
}

/// Describes a single segment as supplied by the Mach-O outer layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentMapEntry {
    /// Segment name (e.g. `__TEXT`).
    pub name: String,

    /// Address the segment wants to be mapped at.
    pub vm_addr: u64,

    /// Offset of the segment's data within the file.
    pub file_offset: u64,

    /// Size of the segment's data within the file.
    pub size: u64,
}

/// Ordered collection of segments, as laid out by load command order.
///
/// The chained fixups starts table references segments by load command
/// index, so order matters and must match the binary.
#[derive(Clone, Debug, Default)]
pub struct SegmentMap {
    entries: Vec<SegmentMapEntry>,
}

impl SegmentMap {
    pub fn new(entries: Vec<SegmentMapEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[SegmentMapEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&SegmentMapEntry> {
        self.entries.get(index)
    }

    /// Translate a vm address to a file offset.
    ///
    /// Returns `None` when no segment covers the address.
    pub fn file_offset_for_vm(&self, vm_addr: u64) -> Option<u64> {
        self.entries.iter().find_map(|entry| {
            if vm_addr >= entry.vm_addr && vm_addr - entry.vm_addr < entry.size {
                Some(entry.file_offset + (vm_addr - entry.vm_addr))
            } else {
                None
            }
        })
    }

    /// The address the image was linked to load at.
    ///
    /// This is the vm address of the segment backing file offset 0 with
    /// actual file content, which is where the Mach-O header lives. Rebase
    /// targets expressed as vm addresses are rebased against this value.
    pub fn preferred_load_address(&self) -> u64 {
        self.entries
            .iter()
            .find(|entry| entry.file_offset == 0 && entry.size > 0)
            .or_else(|| self.entries.first())
            .map(|entry| entry.vm_addr)
            .unwrap_or(0)
    }

    /// Read bytes at a vm address by translating through the map.
    pub fn read_at_vm(
        &self,
        source: &impl ByteSource,
        vm_addr: u64,
        length: usize,
    ) -> Result<Vec<u8>, MachoIntrospectError> {
        let offset = self
            .file_offset_for_vm(vm_addr)
            .ok_or(MachoIntrospectError::OffsetOutsideSegments(vm_addr))?;

        source.read_at(offset, length)
    }
}

impl From<Vec<SegmentMapEntry>> for SegmentMap {
    fn from(entries: Vec<SegmentMapEntry>) -> Self {
        Self::new(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> SegmentMap {
        SegmentMap::new(vec![
            SegmentMapEntry {
                name: "__PAGEZERO".into(),
                vm_addr: 0,
                file_offset: 0,
                size: 0,
            },
            SegmentMapEntry {
                name: "__TEXT".into(),
                vm_addr: 0x1_0000_0000,
                file_offset: 0,
                size: 0x4000,
            },
            SegmentMapEntry {
                name: "__DATA_CONST".into(),
                vm_addr: 0x1_0000_4000,
                file_offset: 0x4000,
                size: 0x4000,
            },
        ])
    }

    #[test]
    fn slice_read_at_bounds() {
        let data = [0u8, 1, 2, 3];

        assert_eq!(data.read_at(1, 2).unwrap(), vec![1, 2]);
        assert_eq!(data.read_at(0, 4).unwrap(), vec![0, 1, 2, 3]);
        assert!(matches!(
            data.read_at(3, 2),
            Err(MachoIntrospectError::ReadOutOfBounds { offset: 3, .. })
        ));
    }

    #[test]
    fn vm_translation() {
        let map = sample_map();

        assert_eq!(map.file_offset_for_vm(0x1_0000_0010), Some(0x10));
        assert_eq!(map.file_offset_for_vm(0x1_0000_4008), Some(0x4008));
        assert_eq!(map.file_offset_for_vm(0x2_0000_0000), None);
    }

    #[test]
    fn preferred_load_address_skips_pagezero() {
        assert_eq!(sample_map().preferred_load_address(), 0x1_0000_0000);
    }
}
