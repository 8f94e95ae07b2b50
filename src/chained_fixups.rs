// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dyld chained fixups engine.
//!
//! `LC_DYLD_CHAINED_FIXUPS` points at a small payload in `__LINKEDIT`
//! holding a header, a starts table locating the first fixup of every page
//! of every segment, an imports table, and a symbols pool. The fixups
//! themselves live in the segment data: each pointer word carries the
//! offset of the next one, forming per-page linked lists that dyld rewrites
//! at page-in time.
//!
//! [ChainedFixups] wraps the payload plus a [ByteSource] over the whole
//! file and exposes three primitives: walk every chain
//! ([ChainedFixups::fixups]), resolve a single file offset
//! ([ChainedFixups::fixup_at]), and classify one raw pointer word
//! ([ChainedFixups::classify_pointer]). Metadata, imports, the segment
//! interval index and the full fixup map are each parsed once and cached.

use {
    crate::{
        error::MachoIntrospectError,
        fixup::{decode_pointer, ChainedFixup},
        pointer_format::PointerFormat,
        reader::{ByteSource, SegmentMap},
    },
    log::warn,
    scroll::Pread,
    std::collections::HashMap,
};

/// Page start sentinel: no fixups on this page.
pub const PAGE_START_NONE: u16 = 0xffff;

/// Page start flag: low bits index the overflow region holding multiple
/// chain starts for this page.
pub const PAGE_START_MULTI: u16 = 0x8000;

/// Overflow entry flag: this is the last chain start for the page.
pub const PAGE_START_LAST: u16 = 0x8000;

/// Import table encoding, from the fixups header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ImportFormat {
    /// 32-bit records, no addend.
    Import = 1,
    /// 32-bit records followed by a signed 32-bit addend.
    ImportWithAddend = 2,
    /// 64-bit records followed by a 64-bit addend.
    ImportAddend64 = 3,
}

impl TryFrom<u32> for ImportFormat {
    type Error = MachoIntrospectError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Import),
            2 => Ok(Self::ImportWithAddend),
            3 => Ok(Self::ImportAddend64),
            _ => Err(MachoIntrospectError::UnknownImportFormat(v)),
        }
    }
}

/// The header of the chained fixups payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainedFixupsHeader {
    pub fixups_version: u32,
    pub starts_offset: u32,
    pub imports_offset: u32,
    pub symbols_offset: u32,
    pub imports_count: u32,
    pub imports_format: u32,
    pub symbols_format: u32,
}

/// Special import library ordinals with meanings other than "nth dylib".
pub const LIBRARY_ORDINAL_SELF: i32 = 0;
pub const LIBRARY_ORDINAL_MAIN_EXECUTABLE: i32 = -1;
pub const LIBRARY_ORDINAL_FLAT_LOOKUP: i32 = -2;
pub const LIBRARY_ORDINAL_WEAK_LOOKUP: i32 = -3;

/// One entry of the imports table, in ordinal order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainedImport {
    /// Which dylib supplies the symbol. 1-based, with special negative
    /// values for self/main-executable/flat/weak lookup.
    pub library_ordinal: i32,

    /// Whether missing resolution is tolerated.
    pub weak_import: bool,

    /// Offset of the name within the symbols pool.
    pub name_offset: u32,

    /// NUL-terminated name read from the symbols pool.
    pub name: String,

    /// Addend carried by the import record itself, for formats that have
    /// one. Binds add this on top of any inline addend.
    pub addend: i64,
}

impl ChainedImport {
    /// Whether the library ordinal is one of the special lookup values.
    pub fn is_special_library_ordinal(&self) -> bool {
        self.library_ordinal <= 0
    }
}

/// Chain starts for one segment, from the starts-in-segment record.
#[derive(Clone, Debug)]
pub struct SegmentStarts {
    /// Index of the segment in load command order.
    pub segment_index: usize,

    /// Page size used to bound chains, in bytes.
    pub page_size: u16,

    /// Pointer encoding governing every chain in the segment.
    pub pointer_format: PointerFormat,

    /// File offset of the segment's data.
    ///
    /// The on-disk record stores the segment's vm offset; when a segment
    /// map is supplied the outer layer's file offset replaces it so chain
    /// locations can be read straight from the byte source.
    pub segment_offset: u64,

    /// Largest value that is a pointer rather than a literal, for 32-bit
    /// formats. 0 when unused.
    pub max_valid_pointer: u32,

    /// Number of pages covered.
    pub page_count: u16,

    /// Page start entries, including the overflow region referenced by
    /// `PAGE_START_MULTI` entries.
    pub page_starts: Vec<u16>,
}

impl SegmentStarts {
    /// File offset one past the last covered page.
    pub fn end_offset(&self) -> u64 {
        self.segment_offset + self.page_count as u64 * self.page_size as u64
    }
}

/// Interval index entry mapping a file range to a segment record.
#[derive(Clone, Copy, Debug)]
struct SegmentInterval {
    start: u64,
    end: u64,
    segment: usize,
}

/// The chained fixups engine over one Mach-O image.
///
/// One logical caller at a time: parse entry points take `&mut self` and
/// populate write-once caches that subsequent queries read.
pub struct ChainedFixups<R: ByteSource> {
    reader: R,
    payload: Vec<u8>,
    endian: scroll::Endian,
    segment_map: SegmentMap,
    preferred_load_address: u64,

    header: ChainedFixupsHeader,

    metadata_parsed: bool,
    segments: Vec<SegmentStarts>,
    pointer_format: Option<PointerFormat>,

    imports: Option<Vec<ChainedImport>>,
    segment_index: Option<Vec<SegmentInterval>>,
    fixups: Option<Vec<ChainedFixup>>,
    rebase_targets: Option<HashMap<u64, usize>>,
}

impl<R: ByteSource> ChainedFixups<R> {
    /// Construct an engine from a byte source rooted at file offset 0, the
    /// `LC_DYLD_CHAINED_FIXUPS` payload, the file's endianness, and the
    /// segment map from the outer Mach-O layer.
    ///
    /// Only the header is parsed eagerly. The starts table, imports, and
    /// fixups are parsed on first use.
    pub fn new(
        reader: R,
        payload: Vec<u8>,
        endian: scroll::Endian,
        segment_map: SegmentMap,
    ) -> Result<Self, MachoIntrospectError> {
        if payload.len() < 28 {
            return Err(MachoIntrospectError::FixupsTruncated(
                payload.len(),
                "chained fixups header",
            ));
        }

        let offset = &mut 0;
        let header = ChainedFixupsHeader {
            fixups_version: payload.gread_with(offset, endian)?,
            starts_offset: payload.gread_with(offset, endian)?,
            imports_offset: payload.gread_with(offset, endian)?,
            symbols_offset: payload.gread_with(offset, endian)?,
            imports_count: payload.gread_with(offset, endian)?,
            imports_format: payload.gread_with(offset, endian)?,
            symbols_format: payload.gread_with(offset, endian)?,
        };

        let preferred_load_address = segment_map.preferred_load_address();

        Ok(Self {
            reader,
            payload,
            endian,
            segment_map,
            preferred_load_address,
            header,
            metadata_parsed: false,
            segments: Vec::new(),
            pointer_format: None,
            imports: None,
            segment_index: None,
            fixups: None,
            rebase_targets: None,
        })
    }

    /// Override the preferred load address derived from the segment map.
    pub fn with_preferred_load_address(mut self, address: u64) -> Self {
        self.preferred_load_address = address;
        self
    }

    pub fn header(&self) -> &ChainedFixupsHeader {
        &self.header
    }

    /// Parse the starts table.
    ///
    /// Idempotent. A successful parse invalidates the cached segment
    /// interval index and fixup map so they rebuild from fresh metadata.
    pub fn parse_metadata(&mut self) -> Result<(), MachoIntrospectError> {
        if self.metadata_parsed {
            return Ok(());
        }

        let data = self.payload.as_slice();
        let starts_base = self.header.starts_offset as usize;

        let offset = &mut { starts_base };
        let seg_count = data.gread_with::<u32>(offset, self.endian)? as usize;

        let mut seg_info_offsets = Vec::with_capacity(seg_count);
        for _ in 0..seg_count {
            seg_info_offsets.push(data.gread_with::<u32>(offset, self.endian)?);
        }

        let mut segments = Vec::new();
        let mut pointer_format = None;

        for (segment_index, seg_info_offset) in seg_info_offsets.iter().enumerate() {
            // A zero offset means the segment has no fixups.
            if *seg_info_offset == 0 {
                continue;
            }

            let base = starts_base + *seg_info_offset as usize;
            let offset = &mut { base };

            let size = data.gread_with::<u32>(offset, self.endian)? as usize;
            let page_size = data.gread_with::<u16>(offset, self.endian)?;
            let format_raw = data.gread_with::<u16>(offset, self.endian)?;
            let mut segment_offset = data.gread_with::<u64>(offset, self.endian)?;
            let max_valid_pointer = data.gread_with::<u32>(offset, self.endian)?;
            let page_count = data.gread_with::<u16>(offset, self.endian)?;

            let format = PointerFormat::try_from(format_raw)?;

            // The record's size bounds the page start array, which extends
            // past page_count entries when pages have multiple chain starts.
            let entry_count = if size > 22 {
                ((size - 22) / 2).max(page_count as usize)
            } else {
                page_count as usize
            };

            let mut page_starts = Vec::with_capacity(entry_count);
            for _ in 0..entry_count {
                page_starts.push(data.gread_with::<u16>(offset, self.endian)?);
            }

            // The on-disk segment offset is a vm offset. The outer layer
            // knows where the segment actually lives in the file.
            if let Some(entry) = self.segment_map.get(segment_index) {
                segment_offset = entry.file_offset;
            }

            if pointer_format.is_none() {
                pointer_format = Some(format);
            }

            segments.push(SegmentStarts {
                segment_index,
                page_size,
                pointer_format: format,
                segment_offset,
                max_valid_pointer,
                page_count,
                page_starts,
            });
        }

        self.segments = segments;
        self.pointer_format = pointer_format;
        self.metadata_parsed = true;
        self.segment_index = None;
        self.fixups = None;
        self.rebase_targets = None;

        Ok(())
    }

    /// The canonical pointer format: the first one seen in the starts
    /// table. `None` when no segment has fixups.
    pub fn pointer_format(&mut self) -> Result<Option<PointerFormat>, MachoIntrospectError> {
        self.parse_metadata()?;
        Ok(self.pointer_format)
    }

    /// Per-segment chain start records.
    pub fn segments(&mut self) -> Result<&[SegmentStarts], MachoIntrospectError> {
        self.parse_metadata()?;
        Ok(&self.segments)
    }

    /// The imports table, in ordinal order. Parsed once on first use.
    pub fn imports(&mut self) -> Result<&[ChainedImport], MachoIntrospectError> {
        self.ensure_imports()?;
        Ok(self.imports.as_deref().unwrap_or(&[]))
    }

    fn ensure_imports(&mut self) -> Result<(), MachoIntrospectError> {
        if self.imports.is_some() {
            return Ok(());
        }

        if self.header.symbols_format != 0 {
            return Err(MachoIntrospectError::UnsupportedSymbolsFormat(
                self.header.symbols_format,
            ));
        }

        let format = ImportFormat::try_from(self.header.imports_format)?;
        let data = self.payload.as_slice();

        let symbols_base = self.header.symbols_offset as usize;
        if symbols_base > data.len() {
            return Err(MachoIntrospectError::FixupsTruncated(
                symbols_base,
                "symbols pool",
            ));
        }
        let symbols = &data[symbols_base..];

        let offset = &mut (self.header.imports_offset as usize);
        let mut imports = Vec::with_capacity(self.header.imports_count as usize);

        for _ in 0..self.header.imports_count {
            let (library_ordinal, weak_import, name_offset, addend) = match format {
                ImportFormat::Import => {
                    let raw = data.gread_with::<u32>(offset, self.endian)?;
                    (
                        library_ordinal_8((raw & 0xff) as u8),
                        raw & 0x100 != 0,
                        raw >> 9,
                        0i64,
                    )
                }
                ImportFormat::ImportWithAddend => {
                    let raw = data.gread_with::<u32>(offset, self.endian)?;
                    let addend = data.gread_with::<i32>(offset, self.endian)?;
                    (
                        library_ordinal_8((raw & 0xff) as u8),
                        raw & 0x100 != 0,
                        raw >> 9,
                        addend as i64,
                    )
                }
                ImportFormat::ImportAddend64 => {
                    let raw = data.gread_with::<u64>(offset, self.endian)?;
                    let addend = data.gread_with::<u64>(offset, self.endian)?;
                    (
                        library_ordinal_16((raw & 0xffff) as u16),
                        raw & 0x1_0000 != 0,
                        (raw >> 32) as u32,
                        addend as i64,
                    )
                }
            };

            let name = read_pool_string(symbols, name_offset)?;

            imports.push(ChainedImport {
                library_ordinal,
                weak_import,
                name_offset,
                name,
                addend,
            });
        }

        self.imports = Some(imports);

        Ok(())
    }

    fn ensure_segment_index(&mut self) -> Result<(), MachoIntrospectError> {
        self.parse_metadata()?;

        if self.segment_index.is_some() {
            return Ok(());
        }

        let mut intervals = self
            .segments
            .iter()
            .enumerate()
            .filter(|(_, seg)| seg.page_count > 0)
            .map(|(i, seg)| SegmentInterval {
                start: seg.segment_offset,
                end: seg.end_offset(),
                segment: i,
            })
            .collect::<Vec<_>>();

        intervals.sort_by_key(|interval| interval.start);
        self.segment_index = Some(intervals);

        Ok(())
    }

    /// Locate the segment record covering a file offset.
    fn segment_for_offset(&self, offset: u64) -> Option<usize> {
        let index = self.segment_index.as_ref()?;

        // Greatest interval start <= offset.
        let pos = index.partition_point(|interval| interval.start <= offset);
        let interval = index[..pos].last()?;

        (offset < interval.end).then(|| interval.segment)
    }

    /// Walk every chain of every segment.
    ///
    /// Fixups are emitted in segment order, then page order, then chain
    /// order, and cached along with a rebase target index. Chains that
    /// run past their page are terminated early; remaining pages still
    /// walk.
    pub fn fixups(&mut self) -> Result<&[ChainedFixup], MachoIntrospectError> {
        self.ensure_walked()?;
        Ok(self.fixups.as_deref().unwrap_or(&[]))
    }

    /// Reverse-lookup a rebase by its target offset.
    ///
    /// When corrupt input makes several rebases collide on one target, the
    /// one emitted last wins.
    pub fn fixup_for_target(
        &mut self,
        target: u64,
    ) -> Result<Option<&ChainedFixup>, MachoIntrospectError> {
        self.ensure_walked()?;

        let fixups = self.fixups.as_deref().unwrap_or(&[]);

        Ok(self
            .rebase_targets
            .as_ref()
            .and_then(|targets| targets.get(&target))
            .map(|index| &fixups[*index]))
    }

    fn ensure_walked(&mut self) -> Result<(), MachoIntrospectError> {
        self.parse_metadata()?;
        self.ensure_imports()?;

        if self.fixups.is_some() {
            return Ok(());
        }

        let total_pages = self
            .segments
            .iter()
            .map(|seg| seg.page_count as usize)
            .sum::<usize>();

        // Capacity hint: pages average a handful of fixups each.
        let mut fixups = Vec::with_capacity(total_pages * 8);
        let mut targets = HashMap::with_capacity(total_pages * 8);

        for seg in &self.segments {
            for page_index in 0..seg.page_count as usize {
                let start = seg.page_starts[page_index];

                if start == PAGE_START_NONE {
                    continue;
                }

                if start & PAGE_START_MULTI != 0 {
                    let mut index = (start & !PAGE_START_MULTI) as usize;

                    loop {
                        let entry = *seg.page_starts.get(index).ok_or(
                            MachoIntrospectError::PageStartOverflow(
                                index,
                                seg.page_starts.len(),
                            ),
                        )?;
                        let last = entry & PAGE_START_LAST != 0;

                        walk_chain(
                            &self.reader,
                            self.endian,
                            seg,
                            page_index,
                            entry & !PAGE_START_LAST,
                            self.preferred_load_address,
                            self.imports.as_deref().unwrap_or(&[]),
                            &mut |fixup| {
                                if let Some(target) = fixup.rebase_target() {
                                    targets.insert(target, fixups.len());
                                }
                                fixups.push(fixup);
                            },
                        )?;

                        if last {
                            break;
                        }
                        index += 1;
                    }
                } else {
                    walk_chain(
                        &self.reader,
                        self.endian,
                        seg,
                        page_index,
                        start,
                        self.preferred_load_address,
                        self.imports.as_deref().unwrap_or(&[]),
                        &mut |fixup| {
                            if let Some(target) = fixup.rebase_target() {
                                targets.insert(target, fixups.len());
                            }
                            fixups.push(fixup);
                        },
                    )?;
                }
            }
        }

        self.fixups = Some(fixups);
        self.rebase_targets = Some(targets);

        Ok(())
    }

    /// Resolve the fixup at a single file offset without a full walk.
    ///
    /// Returns `Ok(None)` when the offset lies within a fixups-covered
    /// segment but no chain visits it. Offsets outside every covered
    /// segment are an error: the caller is probing something the engine
    /// knows nothing about.
    pub fn fixup_at(
        &mut self,
        offset: u64,
    ) -> Result<Option<ChainedFixup>, MachoIntrospectError> {
        self.ensure_imports()?;
        self.ensure_segment_index()?;

        let segment = self
            .segment_for_offset(offset)
            .ok_or(MachoIntrospectError::OffsetOutsideSegments(offset))?;
        let seg = &self.segments[segment];

        let info = seg.pointer_format.info();
        let page_size = seg.page_size as u64;
        let relative = offset - seg.segment_offset;
        let page_index = (relative / page_size) as usize;
        let in_page = relative % page_size;

        let start = seg.page_starts[page_index];
        if start == PAGE_START_NONE {
            return Ok(None);
        }

        // Chain entries land on stride granularity, never finer.
        let alignment = (info.stride as u64).min(info.word_size as u64);
        if in_page % alignment != 0 {
            return Ok(None);
        }

        let mut try_start = |first: u16| -> Result<Option<ChainedFixup>, MachoIntrospectError> {
            // Chains are strictly monotonic; a start past the target
            // cannot reach it.
            if first as u64 > in_page {
                return Ok(None);
            }

            let mut cursor = first as u64;

            loop {
                if cursor + info.word_size as u64 > page_size {
                    return Ok(None);
                }

                let location = seg.segment_offset + page_index as u64 * page_size + cursor;
                let raw = read_word(&self.reader, self.endian, location, info.word_size)?;
                let mut fixup = decode_pointer(
                    seg.pointer_format,
                    location,
                    raw,
                    self.preferred_load_address,
                );

                if cursor == in_page {
                    resolve_bind_name(&mut fixup, self.imports.as_deref().unwrap_or(&[]));
                    return Ok(Some(fixup));
                }

                let next = fixup.next();
                if next == 0 {
                    return Ok(None);
                }

                cursor += next as u64 * info.stride as u64;
                if cursor > in_page {
                    return Ok(None);
                }
            }
        };

        if start & PAGE_START_MULTI != 0 {
            let mut index = (start & !PAGE_START_MULTI) as usize;

            loop {
                let entry = *seg.page_starts.get(index).ok_or(
                    MachoIntrospectError::PageStartOverflow(index, seg.page_starts.len()),
                )?;
                let last = entry & PAGE_START_LAST != 0;

                if let Some(fixup) = try_start(entry & !PAGE_START_LAST)? {
                    return Ok(Some(fixup));
                }

                if last {
                    break;
                }
                index += 1;
            }

            Ok(None)
        } else {
            try_start(start)
        }
    }

    /// Classify a raw pointer word read from `location`, using the format
    /// governing that location's segment (falling back to the canonical
    /// format when the location is outside every covered segment).
    pub fn classify_pointer(
        &mut self,
        location: u64,
        raw: u64,
    ) -> Result<ChainedFixup, MachoIntrospectError> {
        self.ensure_segment_index()?;

        let format = self
            .segment_for_offset(location)
            .map(|index| self.segments[index].pointer_format)
            .or(self.pointer_format)
            .ok_or(MachoIntrospectError::OffsetOutsideSegments(location))?;

        Ok(decode_pointer(
            format,
            location,
            raw,
            self.preferred_load_address,
        ))
    }
}

/// Map an 8-bit library ordinal to its signed meaning.
fn library_ordinal_8(v: u8) -> i32 {
    if v >= 0xf0 {
        (v as i8) as i32
    } else {
        v as i32
    }
}

/// Map a 16-bit library ordinal to its signed meaning.
fn library_ordinal_16(v: u16) -> i32 {
    if v >= 0xfff0 {
        (v as i16) as i32
    } else {
        v as i32
    }
}

/// Read a NUL-terminated UTF-8 string from the symbols pool.
fn read_pool_string(pool: &[u8], offset: u32) -> Result<String, MachoIntrospectError> {
    let start = offset as usize;

    if start >= pool.len() {
        return Err(MachoIntrospectError::SymbolsPoolOverrun(offset));
    }

    let bytes = pool[start..]
        .split(|&b| b == 0)
        .next()
        .unwrap_or(&pool[start..]);

    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Read one chain entry word, widening 32-bit words to u64.
fn read_word(
    reader: &impl ByteSource,
    endian: scroll::Endian,
    location: u64,
    word_size: u8,
) -> Result<u64, MachoIntrospectError> {
    let bytes = reader.read_at(location, word_size as usize)?;

    Ok(match word_size {
        4 => bytes.pread_with::<u32>(0, endian)? as u64,
        _ => bytes.pread_with::<u64>(0, endian)?,
    })
}

fn resolve_bind_name(fixup: &mut ChainedFixup, imports: &[ChainedImport]) {
    if let Some(ordinal) = fixup.bind_ordinal() {
        // Out-of-range ordinals keep the empty name rather than failing
        // the walk.
        if let Some(import) = imports.get(ordinal as usize) {
            fixup.set_bind_name(import.name.clone());
        }
    }
}

/// Walk one chain, emitting each decoded entry.
///
/// A chain whose next pointer would leave the page is terminated at the
/// page boundary. Read failures from the byte source propagate.
#[allow(clippy::too_many_arguments)]
fn walk_chain(
    reader: &impl ByteSource,
    endian: scroll::Endian,
    seg: &SegmentStarts,
    page_index: usize,
    first: u16,
    preferred_load_address: u64,
    imports: &[ChainedImport],
    emit: &mut dyn FnMut(ChainedFixup),
) -> Result<(), MachoIntrospectError> {
    let info = seg.pointer_format.info();
    let page_size = seg.page_size as u64;
    let page_base = seg.segment_offset + page_index as u64 * page_size;

    let mut cursor = first as u64;

    loop {
        if cursor + info.word_size as u64 > page_size {
            break;
        }

        let location = page_base + cursor;
        let raw = read_word(reader, endian, location, info.word_size)?;
        let mut fixup = decode_pointer(seg.pointer_format, location, raw, preferred_load_address);
        resolve_bind_name(&mut fixup, imports);

        let next = fixup.next();
        emit(fixup);

        if next == 0 {
            break;
        }

        cursor += next as u64 * info.stride as u64;

        if cursor >= page_size {
            warn!(
                "chain in segment {} page {} runs past the page; terminating",
                seg.segment_index, page_index
            );
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{fixup::PointerKey, reader::SegmentMapEntry},
        scroll::{Pwrite, LE},
    };

    const SEG_FILE_OFFSET: u64 = 0x4000;
    const PAGE_SIZE: u16 = 0x1000;

    /// Little helper accreting a fixups payload.
    struct PayloadBuilder {
        data: Vec<u8>,
    }

    impl PayloadBuilder {
        fn new() -> Self {
            Self { data: Vec::new() }
        }

        fn u16(&mut self, v: u16) -> &mut Self {
            let offset = self.data.len();
            self.data.resize(offset + 2, 0);
            self.data.pwrite_with(v, offset, LE).unwrap();
            self
        }

        fn u32(&mut self, v: u32) -> &mut Self {
            let offset = self.data.len();
            self.data.resize(offset + 4, 0);
            self.data.pwrite_with(v, offset, LE).unwrap();
            self
        }

        fn u64(&mut self, v: u64) -> &mut Self {
            let offset = self.data.len();
            self.data.resize(offset + 8, 0);
            self.data.pwrite_with(v, offset, LE).unwrap();
            self
        }

        fn bytes(&mut self, v: &[u8]) -> &mut Self {
            self.data.extend_from_slice(v);
            self
        }
    }

    /// Payload with one fixups-bearing segment (load command index 1) of
    /// two pages, plus an imports table of two plain-format entries.
    fn build_payload(format: PointerFormat, page_starts: &[u16]) -> Vec<u8> {
        let symbols = b"_malloc\0_free\0";

        let starts_offset = 28u32;
        // starts_in_image: seg_count + 2 offsets.
        let seg_info_offset = 4 + 2 * 4;
        let seg_info_size = 22 + 2 * page_starts.len();
        // Pad the segment record to 4-byte alignment.
        let seg_info_padded = (seg_info_size + 3) & !3;
        let imports_offset = starts_offset + seg_info_offset + seg_info_padded as u32;
        let symbols_offset = imports_offset + 2 * 4;

        let mut b = PayloadBuilder::new();
        // Header.
        b.u32(0)
            .u32(starts_offset)
            .u32(imports_offset)
            .u32(symbols_offset)
            .u32(2)
            .u32(ImportFormat::Import as u32)
            .u32(0);
        // starts_in_image: segment 0 has no fixups.
        b.u32(2).u32(0).u32(seg_info_offset as u32);
        // starts_in_segment.
        b.u32(seg_info_size as u32)
            .u16(PAGE_SIZE)
            .u16(format as u16)
            .u64(0x1_0000)
            .u32(0)
            .u16(2);
        for start in page_starts {
            b.u16(*start);
        }
        for _ in 0..(seg_info_padded - seg_info_size) {
            b.bytes(&[0]);
        }
        // Imports: ordinal 0 -> _malloc (lib 1), ordinal 1 -> _free
        // (lib 2, weak, name offset 8).
        b.u32((0u32 << 9) | 1).u32((8u32 << 9) | 0x100 | 2);
        b.bytes(symbols);

        b.data
    }

    /// A 0x8000-byte image with 64-bit words written at chosen offsets.
    fn build_image(words: &[(u64, u64)]) -> Vec<u8> {
        let mut image = vec![0u8; 0x8000];

        for (offset, word) in words {
            image.pwrite_with(*word, *offset as usize, LE).unwrap();
        }

        image
    }

    fn segment_map() -> SegmentMap {
        SegmentMap::new(vec![
            SegmentMapEntry {
                name: "__TEXT".into(),
                vm_addr: 0x1_0000_0000,
                file_offset: 0,
                size: 0x4000,
            },
            SegmentMapEntry {
                name: "__DATA_CONST".into(),
                vm_addr: 0x1_0000_4000,
                file_offset: SEG_FILE_OFFSET,
                size: 0x2000,
            },
        ])
    }

    fn engine(
        format: PointerFormat,
        page_starts: &[u16],
        words: &[(u64, u64)],
    ) -> ChainedFixups<Vec<u8>> {
        ChainedFixups::new(
            build_image(words),
            build_payload(format, page_starts),
            LE,
            segment_map(),
        )
        .unwrap()
    }

    /// 64-bit offset-format rebase word.
    fn rebase64(target: u64, next: u64) -> u64 {
        (next << 51) | target
    }

    /// 64-bit bind word.
    fn bind64(ordinal: u64, addend: u64, next: u64) -> u64 {
        (1 << 63) | (next << 51) | (addend << 24) | ordinal
    }

    #[test]
    fn header_parses() {
        let mut fixups = engine(PointerFormat::Ptr64Offset, &[PAGE_START_NONE, PAGE_START_NONE], &[]);

        assert_eq!(fixups.header().imports_count, 2);
        assert_eq!(
            fixups.pointer_format().unwrap(),
            Some(PointerFormat::Ptr64Offset)
        );

        let segments = fixups.segments().unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].segment_index, 1);
        // File offset from the segment map replaces the vm offset 0x1_0000.
        assert_eq!(segments[0].segment_offset, SEG_FILE_OFFSET);
    }

    #[test]
    fn truncated_header_rejected() {
        let err = ChainedFixups::new(Vec::new(), vec![0u8; 8], LE, SegmentMap::default());

        assert!(matches!(
            err,
            Err(MachoIntrospectError::FixupsTruncated(8, _))
        ));
    }

    #[test]
    fn imports_parse_lazily() {
        let mut fixups = engine(PointerFormat::Ptr64Offset, &[PAGE_START_NONE, PAGE_START_NONE], &[]);

        let imports = fixups.imports().unwrap();
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].name, "_malloc");
        assert_eq!(imports[0].library_ordinal, 1);
        assert!(!imports[0].weak_import);
        assert_eq!(imports[1].name, "_free");
        assert_eq!(imports[1].library_ordinal, 2);
        assert!(imports[1].weak_import);
    }

    #[test]
    fn all_pages_empty_yields_no_fixups() {
        let mut fixups = engine(PointerFormat::Ptr64Offset, &[PAGE_START_NONE, PAGE_START_NONE], &[]);

        assert!(fixups.fixups().unwrap().is_empty());
    }

    #[test]
    fn single_entry_chain() {
        let mut fixups = engine(
            PointerFormat::Ptr64Offset,
            &[0x10, PAGE_START_NONE],
            &[(SEG_FILE_OFFSET + 0x10, rebase64(0x2000, 0))],
        );

        let all = fixups.fixups().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].location(), SEG_FILE_OFFSET + 0x10);
        assert_eq!(all[0].rebase_target(), Some(0x2000));
    }

    #[test]
    fn walk_emits_in_chain_order_and_resolves_names() {
        // Page 0: rebase at 0x10 -> bind at 0x20 -> end.
        // Page 1: bind with out-of-range ordinal at 0x8.
        let mut fixups = engine(
            PointerFormat::Ptr64Offset,
            &[0x10, 0x8],
            &[
                (SEG_FILE_OFFSET + 0x10, rebase64(0x2000, 4)),
                (SEG_FILE_OFFSET + 0x20, bind64(1, 3, 0)),
                (SEG_FILE_OFFSET + 0x1008, bind64(9, 0, 0)),
            ],
        );

        let all = fixups.fixups().unwrap().to_vec();
        assert_eq!(all.len(), 3);

        match &all[0] {
            ChainedFixup::Rebase(rebase) => {
                assert_eq!(rebase.location, SEG_FILE_OFFSET + 0x10);
                assert_eq!(rebase.target, 0x2000);
            }
            other => panic!("expected rebase, got {other:?}"),
        }

        match &all[1] {
            ChainedFixup::Bind(bind) => {
                assert_eq!(bind.ordinal, 1);
                assert_eq!(bind.addend, 3);
                assert_eq!(bind.name, "_free");
            }
            other => panic!("expected bind, got {other:?}"),
        }

        // Out-of-range ordinal produces a bind with an empty name.
        match &all[2] {
            ChainedFixup::Bind(bind) => {
                assert_eq!(bind.ordinal, 9);
                assert_eq!(bind.name, "");
            }
            other => panic!("expected bind, got {other:?}"),
        }

        // Rebase target map answers reverse lookups.
        let hit = fixups.fixup_for_target(0x2000).unwrap().unwrap();
        assert_eq!(hit.location(), SEG_FILE_OFFSET + 0x10);
        assert!(fixups.fixup_for_target(0x9999).unwrap().is_none());
    }

    #[test]
    fn multi_start_page_with_single_last_entry() {
        // MULTI pointing at an overflow region with one LAST entry is the
        // same as a plain single-start page.
        let mut plain = engine(
            PointerFormat::Ptr64Offset,
            &[0x10, PAGE_START_NONE],
            &[(SEG_FILE_OFFSET + 0x10, rebase64(0x2000, 0))],
        );
        let mut multi = engine(
            PointerFormat::Ptr64Offset,
            &[
                PAGE_START_MULTI | 2,
                PAGE_START_NONE,
                PAGE_START_LAST | 0x10,
            ],
            &[(SEG_FILE_OFFSET + 0x10, rebase64(0x2000, 0))],
        );

        assert_eq!(plain.fixups().unwrap(), multi.fixups().unwrap());
    }

    #[test]
    fn multi_start_page_walks_every_chain() {
        let mut fixups = engine(
            PointerFormat::Ptr64Offset,
            &[PAGE_START_MULTI | 2, PAGE_START_NONE, 0x10, PAGE_START_LAST | 0x40],
            &[
                (SEG_FILE_OFFSET + 0x10, rebase64(0x2000, 0)),
                (SEG_FILE_OFFSET + 0x40, rebase64(0x3000, 0)),
            ],
        );

        let all = fixups.fixups().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].rebase_target(), Some(0x2000));
        assert_eq!(all[1].rebase_target(), Some(0x3000));
    }

    #[test]
    fn overflow_index_out_of_bounds_is_an_error() {
        let mut fixups = engine(
            PointerFormat::Ptr64Offset,
            &[PAGE_START_MULTI | 7, PAGE_START_NONE],
            &[],
        );

        assert!(matches!(
            fixups.fixups(),
            Err(MachoIntrospectError::PageStartOverflow(7, _))
        ));
    }

    #[test]
    fn chain_past_page_terminates_early() {
        // next advances 0x7f8 * 4 bytes from 0xc00, leaving the page.
        let mut fixups = engine(
            PointerFormat::Ptr64Offset,
            &[0xc00, PAGE_START_NONE],
            &[(SEG_FILE_OFFSET + 0xc00, rebase64(0x2000, 0x7f8))],
        );

        let all = fixups.fixups().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn resolver_matches_walk() {
        let mut fixups = engine(
            PointerFormat::Ptr64Offset,
            &[0x10, 0x8],
            &[
                (SEG_FILE_OFFSET + 0x10, rebase64(0x2000, 4)),
                (SEG_FILE_OFFSET + 0x20, bind64(1, 3, 0)),
                (SEG_FILE_OFFSET + 0x1008, bind64(0, 0, 0)),
            ],
        );

        let all = fixups.fixups().unwrap().to_vec();

        for expected in &all {
            let got = fixups.fixup_at(expected.location()).unwrap();
            assert_eq!(got.as_ref(), Some(expected));
        }

        // Offsets between chain entries report no fixup.
        assert!(fixups.fixup_at(SEG_FILE_OFFSET + 0x18).unwrap().is_none());
        // Aligned offset after the chain ends.
        assert!(fixups.fixup_at(SEG_FILE_OFFSET + 0x28).unwrap().is_none());
        // Unaligned offset.
        assert!(fixups.fixup_at(SEG_FILE_OFFSET + 0x11).unwrap().is_none());
        // Page with no fixups at all.
        let mut none_page = engine(
            PointerFormat::Ptr64Offset,
            &[PAGE_START_NONE, PAGE_START_NONE],
            &[],
        );
        assert!(none_page.fixup_at(SEG_FILE_OFFSET + 0x10).unwrap().is_none());

        // Offsets outside every covered segment error.
        assert!(matches!(
            fixups.fixup_at(0x100),
            Err(MachoIntrospectError::OffsetOutsideSegments(0x100))
        ));
    }

    #[test]
    fn classify_uses_governing_format() {
        let mut fixups = engine(PointerFormat::Ptr64Offset, &[PAGE_START_NONE, PAGE_START_NONE], &[]);

        let fixup = fixups
            .classify_pointer(SEG_FILE_OFFSET + 0x10, rebase64(0x2000, 0))
            .unwrap();

        assert_eq!(fixup.rebase_target(), Some(0x2000));
    }

    #[test]
    fn arm64e_auth_chain() {
        // Auth rebase (stride 8): target 0x8000, diversity 0xabcd, key DA,
        // address diversified, then one auth bind.
        let auth_rebase =
            (1u64 << 63) | (0b10 << 49) | (1 << 48) | (0xabcd << 32) | (2 << 51) | 0x8000;
        let auth_bind = (1u64 << 63) | (1 << 62) | (0b00 << 49) | 1;

        let mut fixups = engine(
            PointerFormat::Arm64eUserland,
            &[0x0, PAGE_START_NONE],
            &[
                (SEG_FILE_OFFSET, auth_rebase),
                (SEG_FILE_OFFSET + 0x10, auth_bind),
            ],
        );

        let all = fixups.fixups().unwrap();
        assert_eq!(all.len(), 2);

        match &all[0] {
            ChainedFixup::AuthRebase(rebase) => {
                assert_eq!(rebase.target, 0x8000);
                assert_eq!(rebase.diversity, 0xabcd);
                assert_eq!(rebase.key, PointerKey::DA);
                assert!(rebase.addr_div);
            }
            other => panic!("expected auth rebase, got {other:?}"),
        }

        match &all[1] {
            ChainedFixup::AuthBind(bind) => {
                assert_eq!(bind.ordinal, 1);
                assert_eq!(bind.name, "_free");
                assert_eq!(bind.key, PointerKey::IA);
            }
            other => panic!("expected auth bind, got {other:?}"),
        }
    }

    #[test]
    fn import_addend64_format() {
        let symbols = b"_sym\0";

        let mut b = PayloadBuilder::new();
        b.u32(0)
            .u32(0x1c)
            .u32(0x20)
            .u32(0x30)
            .u32(1)
            .u32(ImportFormat::ImportAddend64 as u32)
            .u32(0);
        // Empty starts table.
        b.u32(0);
        // One addend64 import: lib ordinal 3, weak, name offset 0.
        b.u64((0u64 << 32) | 0x1_0000 | 3).u64(42);
        b.bytes(symbols);

        let mut fixups =
            ChainedFixups::new(Vec::new(), b.data, LE, SegmentMap::default()).unwrap();

        let imports = fixups.imports().unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].library_ordinal, 3);
        assert!(imports[0].weak_import);
        assert_eq!(imports[0].addend, 42);
        assert_eq!(imports[0].name, "_sym");
    }

    #[test]
    fn compressed_symbols_rejected() {
        let mut b = PayloadBuilder::new();
        b.u32(0).u32(0x1c).u32(0x20).u32(0x20).u32(0).u32(1).u32(1);
        b.u32(0);

        let mut fixups =
            ChainedFixups::new(Vec::new(), b.data, LE, SegmentMap::default()).unwrap();

        assert!(matches!(
            fixups.imports(),
            Err(MachoIntrospectError::UnsupportedSymbolsFormat(1))
        ));
    }

    #[test]
    fn special_library_ordinals() {
        assert_eq!(library_ordinal_8(0xff), LIBRARY_ORDINAL_MAIN_EXECUTABLE);
        assert_eq!(library_ordinal_8(0xfe), LIBRARY_ORDINAL_FLAT_LOOKUP);
        assert_eq!(library_ordinal_8(0xfd), LIBRARY_ORDINAL_WEAK_LOOKUP);
        assert_eq!(library_ordinal_8(0x02), 2);
        assert_eq!(library_ordinal_16(0xffff), LIBRARY_ORDINAL_MAIN_EXECUTABLE);
        assert_eq!(library_ordinal_16(0x0100), 0x100);
    }
}
