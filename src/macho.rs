// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O primitives bridging parsed binaries into the introspection core.

The core consumes byte sources, segment maps, and load command payloads;
it never walks Mach-O load commands itself. This module is the bridge:
given a goblin-parsed binary it locates the `LC_CODE_SIGNATURE` and
`LC_DYLD_CHAINED_FIXUPS` payloads in `__LINKEDIT`, derives the segment
map, and wires up a [ChainedFixups] engine.
*/

use {
    crate::{
        chained_fixups::ChainedFixups,
        embedded_signature::{DigestType, EmbeddedSignature},
        error::MachoIntrospectError,
        reader::{SegmentMap, SegmentMapEntry},
    },
    goblin::mach::{
        constants::{SEG_LINKEDIT, SEG_PAGEZERO},
        load_command::{CommandVariant, LinkeditDataCommand},
        parse_magic_and_ctx, MachO,
    },
    scroll::Pread,
};

/// `LC_DYLD_CHAINED_FIXUPS` load command constant.
///
/// Not exposed by our goblin version, which reports it as an
/// unimplemented variant.
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x80000034;

/// Describes signature data embedded within a Mach-O binary.
pub struct MachOSignatureData<'a> {
    /// Which segment index is the `__LINKEDIT` segment.
    pub linkedit_segment_index: usize,

    /// Start offset of `__LINKEDIT` segment within the binary.
    pub linkedit_segment_start_offset: usize,

    /// End offset of `__LINKEDIT` segment within the binary.
    pub linkedit_segment_end_offset: usize,

    /// The start offset of the signature data within the `__LINKEDIT` segment.
    pub signature_start_offset: usize,

    /// The end offset of the signature data within the `__LINKEDIT` segment.
    pub signature_end_offset: usize,

    /// Raw data in the `__LINKEDIT` segment.
    pub linkedit_segment_data: &'a [u8],

    /// The signature data within the `__LINKEDIT` segment.
    pub signature_data: &'a [u8],
}

/// Resolve the load command for the code signature, if present.
pub fn code_signature_load_command(macho: &MachO) -> Option<LinkeditDataCommand> {
    macho.load_commands.iter().find_map(|lc| {
        if let CommandVariant::CodeSignature(command) = lc.command {
            Some(command)
        } else {
            None
        }
    })
}

/// Attempt to extract a reference to raw signature data in a Mach-O binary.
///
/// An `LC_CODE_SIGNATURE` load command points at signature data within
/// the `__LINKEDIT` segment.
///
/// This function is used as part of parsing signature data. You probably
/// want to use [code_signature] instead.
pub fn find_signature_data<'a>(
    obj: &'a MachO,
) -> Result<Option<MachOSignatureData<'a>>, MachoIntrospectError> {
    if let Some(linkedit_data_command) = code_signature_load_command(obj) {
        // Now find the slice of data in the __LINKEDIT segment we need to parse.
        let (linkedit_segment_index, linkedit) = obj
            .segments
            .iter()
            .enumerate()
            .find(|(_, segment)| matches!(segment.name(), Ok(SEG_LINKEDIT)))
            .ok_or(MachoIntrospectError::MissingLinkedit)?;

        let linkedit_segment_start_offset = linkedit.fileoff as usize;
        let linkedit_segment_end_offset = linkedit_segment_start_offset + linkedit.data.len();

        let signature_start_offset =
            linkedit_data_command.dataoff as usize - linkedit.fileoff as usize;
        let signature_end_offset = signature_start_offset + linkedit_data_command.datasize as usize;

        if signature_end_offset > linkedit.data.len() {
            return Err(MachoIntrospectError::InvalidBinary(
                "code signature extends past __LINKEDIT".into(),
            ));
        }

        let signature_data = &linkedit.data[signature_start_offset..signature_end_offset];

        Ok(Some(MachOSignatureData {
            linkedit_segment_index,
            linkedit_segment_start_offset,
            linkedit_segment_end_offset,
            signature_start_offset,
            signature_end_offset,
            linkedit_segment_data: linkedit.data,
            signature_data,
        }))
    } else {
        Ok(None)
    }
}

/// Obtain the parsed code signature of a binary.
///
/// Returns `Ok(None)` if no signature exists, `Ok(Some)` if it does, or
/// `Err` if there is a parse error.
pub fn code_signature<'a>(
    macho: &'a MachO,
) -> Result<Option<EmbeddedSignature<'a>>, MachoIntrospectError> {
    if let Some(signature) = find_signature_data(macho)? {
        Ok(Some(EmbeddedSignature::from_bytes(
            signature.signature_data,
        )?))
    } else {
        Ok(None)
    }
}

/// Locate the `LC_DYLD_CHAINED_FIXUPS` payload.
///
/// goblin surfaces the command as unimplemented, so the linkedit data
/// command fields are read straight from the raw bytes.
pub fn find_chained_fixups_data<'a>(
    macho: &MachO,
    macho_data: &'a [u8],
) -> Result<Option<&'a [u8]>, MachoIntrospectError> {
    let ctx = match parse_magic_and_ctx(macho_data, 0)?.1 {
        Some(ctx) => ctx,
        None => {
            return Err(MachoIntrospectError::InvalidBinary(
                "unable to parse Mach-O context".into(),
            ));
        }
    };

    for lc in &macho.load_commands {
        if lc.command.cmd() != LC_DYLD_CHAINED_FIXUPS {
            continue;
        }

        // cmd, cmdsize, dataoff, datasize.
        let dataoff = macho_data.pread_with::<u32>(lc.offset + 8, ctx.le)? as usize;
        let datasize = macho_data.pread_with::<u32>(lc.offset + 12, ctx.le)? as usize;

        if dataoff + datasize > macho_data.len() {
            return Err(MachoIntrospectError::InvalidBinary(
                "chained fixups data extends past end of binary".into(),
            ));
        }

        return Ok(Some(&macho_data[dataoff..dataoff + datasize]));
    }

    Ok(None)
}

/// The file's endianness, as a scroll context value.
pub fn macho_endian(macho_data: &[u8]) -> Result<scroll::Endian, MachoIntrospectError> {
    match parse_magic_and_ctx(macho_data, 0)?.1 {
        Some(ctx) => Ok(ctx.le),
        None => Err(MachoIntrospectError::InvalidBinary(
            "unable to parse Mach-O context".into(),
        )),
    }
}

/// Derive a [SegmentMap] from a parsed binary, in load command order.
pub fn segment_map_from_macho(macho: &MachO) -> SegmentMap {
    SegmentMap::new(
        macho
            .segments
            .iter()
            .map(|segment| SegmentMapEntry {
                name: segment.name().map(|s| s.to_string()).unwrap_or_default(),
                vm_addr: segment.vmaddr,
                file_offset: segment.fileoff,
                size: segment.filesize,
            })
            .collect(),
    )
}

/// Construct a [ChainedFixups] engine for a binary, if it has chained
/// fixups at all.
pub fn chained_fixups_engine<'a>(
    macho: &MachO,
    macho_data: &'a [u8],
) -> Result<Option<ChainedFixups<&'a [u8]>>, MachoIntrospectError> {
    let payload = match find_chained_fixups_data(macho, macho_data)? {
        Some(payload) => payload.to_vec(),
        None => return Ok(None),
    };

    let endian = macho_endian(macho_data)?;
    let segment_map = segment_map_from_macho(macho);

    Ok(Some(ChainedFixups::new(
        macho_data,
        payload,
        endian,
        segment_map,
    )?))
}

/// Obtain `__LINKEDIT` segment data before the code signature.
pub fn linkedit_data_before_signature<'a>(macho: &'a MachO) -> Option<&'a [u8]> {
    let segment = macho
        .segments
        .iter()
        .find(|segment| matches!(segment.name(), Ok(SEG_LINKEDIT)))?;

    if let Some(command) = code_signature_load_command(macho) {
        let offset = (command.dataoff as u64 - segment.fileoff) as usize;
        Some(&segment.data[0..offset.min(segment.data.len())])
    } else {
        Some(segment.data)
    }
}

/// Obtain slices of segment data suitable for digesting.
///
/// These slices are digested to produce the code hashes embedded in a
/// code directory. `__PAGEZERO` carries no file data and is skipped; the
/// `__LINKEDIT` slice stops where the signature starts.
pub fn digestable_segment_data<'a>(macho: &'a MachO) -> Vec<&'a [u8]> {
    macho
        .segments
        .iter()
        .filter(|segment| !matches!(segment.name(), Ok(SEG_PAGEZERO)))
        .map(|segment| {
            if matches!(segment.name(), Ok(SEG_LINKEDIT)) {
                linkedit_data_before_signature(macho).unwrap_or(segment.data)
            } else {
                segment.data
            }
        })
        .collect::<Vec<_>>()
}

/// Compute code hashes for a Mach-O binary.
///
/// Every digestable segment is split into `page_size` chunks and each
/// chunk digested in file order, matching the code slot layout of a code
/// directory over the same binary. Trailing partial pages digest short.
pub fn compute_code_hashes(
    macho: &MachO,
    hash_type: DigestType,
    page_size: usize,
) -> Result<Vec<Vec<u8>>, MachoIntrospectError> {
    let mut hashes = Vec::new();

    for segment in digestable_segment_data(macho) {
        for page in segment.chunks(page_size) {
            hashes.push(hash_type.digest_data(page)?);
        }
    }

    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::adhoc_signing::AdhocSigner,
        anyhow::{anyhow, Result},
        scroll::{Pwrite, LE},
    };

    const LC_SEGMENT_64: u32 = 0x19;
    const LC_CODE_SIGNATURE: u32 = 0x1d;

    const LINKEDIT_FILEOFF: usize = 0x200;
    const FIXUPS_PAYLOAD_LEN: usize = 32;

    /// Hand-assemble a minimal arm64 Mach-O: one __LINKEDIT segment
    /// holding a chained fixups payload followed by an ad-hoc signature.
    fn build_macho() -> Vec<u8> {
        let superblob = AdhocSigner::new("com.example.glue")
            .sign(&[0xccu8; 1024])
            .unwrap();

        let linkedit_size = FIXUPS_PAYLOAD_LEN + superblob.len();
        let mut data = vec![0u8; LINKEDIT_FILEOFF + linkedit_size];
        let offset = &mut 0;

        let mut w = |v: u32, offset: &mut usize| {
            data.pwrite_with(v, *offset, LE).unwrap();
            *offset += 4;
        };

        // mach_header_64.
        w(0xfeedfacf, offset);
        w(0x0100000c, offset); // CPU_TYPE_ARM64
        w(0, offset);
        w(2, offset); // MH_EXECUTE
        w(3, offset); // ncmds
        w(72 + 16 + 16, offset); // sizeofcmds
        w(0, offset);
        w(0, offset);

        // LC_SEGMENT_64 __LINKEDIT.
        w(LC_SEGMENT_64, offset);
        w(72, offset);
        data[*offset..*offset + 10].copy_from_slice(b"__LINKEDIT");
        *offset += 16;
        let mut w64 = |v: u64, offset: &mut usize| {
            data.pwrite_with(v, *offset, LE).unwrap();
            *offset += 8;
        };
        w64(0x1_0000_0000, offset); // vmaddr
        w64(0x1000, offset); // vmsize
        w64(LINKEDIT_FILEOFF as u64, offset); // fileoff
        w64(linkedit_size as u64, offset); // filesize
        let mut w = |v: u32, offset: &mut usize| {
            data.pwrite_with(v, *offset, LE).unwrap();
            *offset += 4;
        };
        w(1, offset); // maxprot
        w(1, offset); // initprot
        w(0, offset); // nsects
        w(0, offset); // flags

        // LC_DYLD_CHAINED_FIXUPS.
        w(LC_DYLD_CHAINED_FIXUPS, offset);
        w(16, offset);
        w(LINKEDIT_FILEOFF as u32, offset);
        w(FIXUPS_PAYLOAD_LEN as u32, offset);

        // LC_CODE_SIGNATURE.
        w(LC_CODE_SIGNATURE, offset);
        w(16, offset);
        w((LINKEDIT_FILEOFF + FIXUPS_PAYLOAD_LEN) as u32, offset);
        w(superblob.len() as u32, offset);

        // Chained fixups payload: header pointing at an empty starts
        // table at offset 28.
        let payload_base = LINKEDIT_FILEOFF;
        for (i, value) in [0u32, 28, 32, 32, 0, 1, 0].iter().enumerate() {
            data.pwrite_with(*value, payload_base + i * 4, LE).unwrap();
        }
        // seg_count = 0.
        data.pwrite_with(0u32, payload_base + 28, LE).unwrap();

        // Signature data.
        let sig_base = LINKEDIT_FILEOFF + FIXUPS_PAYLOAD_LEN;
        data[sig_base..sig_base + superblob.len()].copy_from_slice(&superblob);

        data
    }

    #[test]
    fn locates_signature_and_fixups() -> Result<()> {
        let data = build_macho();
        let macho = MachO::parse(&data, 0)?;

        let signature_data = find_signature_data(&macho)?
            .ok_or_else(|| anyhow!("expected signature data"))?;
        assert_eq!(signature_data.linkedit_segment_start_offset, LINKEDIT_FILEOFF);
        assert_eq!(signature_data.signature_start_offset, FIXUPS_PAYLOAD_LEN);

        let signature =
            code_signature(&macho)?.ok_or_else(|| anyhow!("expected a code signature"))?;
        let cd = signature
            .code_directory()?
            .ok_or_else(|| anyhow!("expected a code directory"))?;
        assert_eq!(cd.ident, "com.example.glue");

        let payload = find_chained_fixups_data(&macho, &data)?
            .ok_or_else(|| anyhow!("expected chained fixups data"))?;
        assert_eq!(payload.len(), FIXUPS_PAYLOAD_LEN);

        assert_eq!(macho_endian(&data)?, LE);

        Ok(())
    }

    #[test]
    fn segment_map_reflects_load_commands() {
        let data = build_macho();
        let macho = MachO::parse(&data, 0).unwrap();

        let map = segment_map_from_macho(&macho);

        assert_eq!(map.entries().len(), 1);
        assert_eq!(map.entries()[0].name, "__LINKEDIT");
        assert_eq!(map.entries()[0].file_offset, LINKEDIT_FILEOFF as u64);
    }

    #[test]
    fn engine_builds_from_binary() {
        let data = build_macho();
        let macho = MachO::parse(&data, 0).unwrap();

        let mut engine = chained_fixups_engine(&macho, &data).unwrap().unwrap();

        // The payload declares no segments with fixups.
        assert!(engine.fixups().unwrap().is_empty());
        assert_eq!(engine.pointer_format().unwrap(), None);
    }

    #[test]
    fn digestable_data_stops_at_signature() {
        let data = build_macho();
        let macho = MachO::parse(&data, 0).unwrap();

        let segments = digestable_segment_data(&macho);

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].len(), FIXUPS_PAYLOAD_LEN);

        let hashes = compute_code_hashes(&macho, DigestType::Sha256, 4096).unwrap();
        assert_eq!(hashes.len(), 1);
    }
}
