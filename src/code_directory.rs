// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, Blob, CodeSigningMagic, CodeSigningSlot, Digest,
            DigestType,
        },
        error::MachoIntrospectError,
    },
    log::warn,
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, collections::HashMap, io::Write, str::FromStr},
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

impl FromStr for CodeSignatureFlags {
    type Err = MachoIntrospectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::HOST),
            "hard" => Ok(Self::FORCE_HARD),
            "kill" => Ok(Self::FORCE_KILL),
            "expires" => Ok(Self::FORCE_EXPIRATION),
            "library" => Ok(Self::LIBRARY_VALIDATION),
            "runtime" => Ok(Self::RUNTIME),
            "linker-signed" => Ok(Self::LINKER_SIGNED),
            _ => Err(MachoIntrospectError::CodeSignatureUnknownFlag(
                s.to_string(),
            )),
        }
    }
}

impl CodeSignatureFlags {
    /// Attempt to convert a series of strings into a [CodeSignatureFlags].
    pub fn from_strs(s: &[&str]) -> Result<CodeSignatureFlags, MachoIntrospectError> {
        let mut flags = CodeSignatureFlags::empty();

        for s in s {
            flags |= Self::from_str(s)?;
        }

        Ok(flags)
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

impl FromStr for ExecutableSegmentFlags {
    type Err = MachoIntrospectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main-binary" => Ok(Self::MAIN_BINARY),
            "allow-unsigned" => Ok(Self::ALLOW_UNSIGNED),
            "debugger" => Ok(Self::DEBUGGER),
            "jit" => Ok(Self::JIT),
            "skip-library-validation" => Ok(Self::SKIP_LIBRARY_VALIDATION),
            "can-load-cd-hash" => Ok(Self::CAN_LOAD_CD_HASH),
            "can-exec-cd-hash" => Ok(Self::CAN_EXEC_CD_HASH),
            _ => Err(MachoIntrospectError::ExecutableSegmentUnknownFlag(
                s.to_string(),
            )),
        }
    }
}

/// Version of Code Directory data structure.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
    SupportsLinkage = 0x20600,
}

/// Earliest code directory version we expect to see.
pub const CODE_DIRECTORY_EARLIEST_VERSION: u32 = 0x20001;

/// Newest version this code knows about. Directories above this still
/// decode best-effort.
pub const CODE_DIRECTORY_COMPATIBILITY_LIMIT: u32 = 0x2f000;

fn get_hashes(
    data: &[u8],
    offset: usize,
    count: usize,
    hash_size: usize,
) -> Result<Vec<Digest<'_>>, MachoIntrospectError> {
    let end = offset + count * hash_size;

    if end > data.len() {
        return Err(MachoIntrospectError::CodeDirectoryHashesOutOfBounds(
            offset,
            data.len(),
        ));
    }

    Ok(data[offset..end]
        .chunks(hash_size)
        .map(|data| Digest { data: data.into() })
        .collect())
}

fn read_nul_terminated(data: &[u8], offset: usize) -> Option<&[u8]> {
    data.get(offset..)?.split(|&b| b == 0).next()
}

/// Represents a code directory blob entry.
///
/// This struct is versioned and has been extended over time. The struct
/// here represents a superset of all fields in all versions.
///
/// The parser will set `Option<T>` fields to `None` for instances
/// where the version is lower than the version that field was introduced in.
#[derive(Debug)]
pub struct CodeDirectoryBlob<'a> {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    // hash_offset, ident_offset, n_special_slots, and n_code_slots not stored
    // explicitly because they are redundant with derived fields.
    /// Limit to main image signature range.
    ///
    /// This is the file-level offset to stop digesting code data at. It
    /// usually corresponds to the offset where the embedded signature data
    /// starts in the `__LINKEDIT` segment.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Type of hash.
    pub hash_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// Page size in bytes. (Stored as log2 on the wire.)
    pub page_size: u32,
    /// Unused (must be 0).
    pub spare2: u32,
    // Version 0x20100
    /// Offset of optional scatter vector.
    pub scatter_offset: Option<u32>,
    // Version 0x20200
    // team_offset not stored because it is redundant with the derived str.
    // Version 0x20300
    /// Unused (must be 0).
    pub spare3: Option<u32>,
    /// Limit to main image signature range, 64 bits.
    pub code_limit_64: Option<u64>,
    // Version 0x20400
    /// Offset of executable segment.
    pub exec_seg_base: Option<u64>,
    /// Limit of executable segment.
    pub exec_seg_limit: Option<u64>,
    /// Executable segment flags.
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    // Version 0x20500
    pub runtime: Option<u32>,
    pub pre_encrypt_offset: Option<u32>,
    // Version 0x20600
    pub linkage_hash_type: Option<u8>,
    pub linkage_truncated: Option<u8>,
    pub spare4: Option<u16>,
    pub linkage_offset: Option<u32>,
    pub linkage_size: Option<u32>,

    // End of blob header data / start of derived data.
    pub ident: Cow<'a, str>,
    pub team_name: Option<Cow<'a, str>>,
    pub code_hashes: Vec<Digest<'a>>,
    pub special_hashes: HashMap<CodeSigningSlot, Digest<'a>>,

    /// Hashes over pre-encryption content, for runtime-version directories
    /// with a non-zero pre-encrypt offset. One per code slot.
    pub pre_encrypt_hashes: Vec<Digest<'a>>,

    /// Raw linkage payload, for linkage-version directories.
    pub linkage_data: Option<Cow<'a, [u8]>>,

    /// The serialized blob this instance was parsed from, trimmed to the
    /// declared length. The cdhash must cover these exact bytes; instances
    /// constructed in memory have `None` and digest their serialization.
    pub blob_data: Option<Cow<'a, [u8]>>,
}

impl<'a> Default for CodeDirectoryBlob<'a> {
    fn default() -> Self {
        Self {
            version: CodeDirectoryVersion::SupportsExecutableSegment as u32,
            flags: CodeSignatureFlags::empty(),
            code_limit: 0,
            hash_size: 32,
            hash_type: DigestType::Sha256,
            platform: 0,
            page_size: 4096,
            spare2: 0,
            scatter_offset: None,
            spare3: None,
            code_limit_64: None,
            exec_seg_base: None,
            exec_seg_limit: None,
            exec_seg_flags: None,
            runtime: None,
            pre_encrypt_offset: None,
            linkage_hash_type: None,
            linkage_truncated: None,
            spare4: None,
            linkage_offset: None,
            linkage_size: None,
            ident: "".into(),
            team_name: None,
            code_hashes: Vec::new(),
            special_hashes: HashMap::new(),
            pre_encrypt_hashes: Vec::new(),
            linkage_data: None,
            blob_data: None,
        }
    }
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachoIntrospectError> {
        read_and_validate_blob_header(data, Self::magic(), "code directory blob")?;

        let declared_length = data.pread_with::<u32>(4, scroll::BE)? as usize;
        let data = if declared_length <= data.len() {
            &data[..declared_length]
        } else {
            data
        };

        let offset = &mut 8;

        let version = data.gread_with(offset, scroll::BE)?;

        if !(CODE_DIRECTORY_EARLIEST_VERSION..=CODE_DIRECTORY_COMPATIBILITY_LIMIT)
            .contains(&version)
        {
            warn!("code directory version {version:#x} outside the supported window; decoding best-effort");
        }

        let flags = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = unsafe { CodeSignatureFlags::from_bits_unchecked(flags) };
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let code_limit = data.gread_with(offset, scroll::BE)?;
        let hash_size = data.gread_with(offset, scroll::BE)?;
        let hash_type = data.gread_with::<u8>(offset, scroll::BE)?.into();
        let platform = data.gread_with(offset, scroll::BE)?;
        let page_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let page_size = 2u32.pow(page_size as u32);
        let spare2 = data.gread_with(offset, scroll::BE)?;

        let scatter_offset = if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            let v = data.gread_with(offset, scroll::BE)?;

            if v != 0 {
                Some(v)
            } else {
                None
            }
        } else {
            None
        };
        let team_offset = if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            let v = data.gread_with::<u32>(offset, scroll::BE)?;

            if v != 0 {
                Some(v)
            } else {
                None
            }
        } else {
            None
        };

        let (spare3, code_limit_64) = if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32
        {
            (
                Some(data.gread_with(offset, scroll::BE)?),
                Some(data.gread_with(offset, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with::<u64>(offset, scroll::BE)?),
                )
            } else {
                (None, None, None)
            };

        let exec_seg_flags = exec_seg_flags
            .map(|flags| unsafe { ExecutableSegmentFlags::from_bits_unchecked(flags) });

        let (runtime, pre_encrypt_offset) =
            if version >= CodeDirectoryVersion::SupportsRuntime as u32 {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                )
            } else {
                (None, None)
            };

        let (linkage_hash_type, linkage_truncated, spare4, linkage_offset, linkage_size) =
            if version >= CodeDirectoryVersion::SupportsLinkage as u32 {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                )
            } else {
                (None, None, None, None, None)
            };

        // Find trailing null in identifier string.
        let ident = match read_nul_terminated(data, ident_offset as usize)
            .map(std::str::from_utf8)
        {
            Some(Ok(res)) => Cow::from(res),
            _ => {
                return Err(MachoIntrospectError::CodeDirectoryMalformedIdentifier);
            }
        };

        let team_name = if let Some(team_offset) = team_offset {
            match read_nul_terminated(data, team_offset as usize).map(std::str::from_utf8) {
                Some(Ok(res)) => Some(Cow::from(res)),
                _ => {
                    return Err(MachoIntrospectError::CodeDirectoryMalformedTeam);
                }
            }
        } else {
            None
        };

        let code_hashes = get_hashes(
            data,
            hash_offset as usize,
            n_code_slots as usize,
            hash_size as usize,
        )?;

        // Special slots sit immediately before the hash offset, indexed in
        // reverse: slot 1 is adjacent to hash_offset, slot N furthest away.
        let special_hashes = get_hashes(
            data,
            (hash_offset as usize)
                .checked_sub(hash_size as usize * n_special_slots as usize)
                .ok_or(MachoIntrospectError::CodeDirectoryHashesOutOfBounds(
                    hash_offset as usize,
                    data.len(),
                ))?,
            n_special_slots as usize,
            hash_size as usize,
        )?
        .into_iter()
        .enumerate()
        .map(|(i, h)| (CodeSigningSlot::from(n_special_slots - i as u32), h))
        .collect();

        let pre_encrypt_hashes = match pre_encrypt_offset {
            Some(pre_encrypt_offset) if pre_encrypt_offset != 0 => get_hashes(
                data,
                pre_encrypt_offset as usize,
                n_code_slots as usize,
                hash_size as usize,
            )?,
            _ => Vec::new(),
        };

        let linkage_data = match (linkage_offset, linkage_size) {
            (Some(linkage_offset), Some(linkage_size))
                if linkage_offset != 0 && linkage_size != 0 =>
            {
                let start = linkage_offset as usize;
                let end = start + linkage_size as usize;

                if end > data.len() {
                    return Err(MachoIntrospectError::CodeDirectoryHashesOutOfBounds(
                        start,
                        data.len(),
                    ));
                }

                Some(Cow::from(&data[start..end]))
            }
            _ => None,
        };

        Ok(Self {
            version,
            flags,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size,
            spare2,
            scatter_offset,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            pre_encrypt_offset,
            linkage_hash_type,
            linkage_truncated,
            spare4,
            linkage_offset,
            linkage_size,
            ident,
            team_name,
            code_hashes,
            special_hashes,
            pre_encrypt_hashes,
            linkage_data,
            blob_data: Some(Cow::from(data)),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachoIntrospectError> {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        // We need 2 phases because offsets aren't known until the fixed
        // fields are all written.

        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits(), scroll::BE)?;
        let hash_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        let ident_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;

        // The recorded hash offset is the beginning of code hashes.
        // Special hashes sit in "negative" indices before that offset, at
        // the index of their CodeSigningSlot constant, so missing special
        // slots get zero-filled placeholders.
        let highest_slot = self
            .special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        cursor.iowrite_with(highest_slot, scroll::BE)?;
        cursor.iowrite_with(self.code_hashes.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(self.hash_size, scroll::BE)?;
        cursor.iowrite_with(u8::from(self.hash_type), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        cursor.iowrite_with(self.page_size.trailing_zeros() as u8, scroll::BE)?;
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        let mut scatter_offset_cursor_position = None;
        let mut team_offset_cursor_position = None;

        if self.version >= CodeDirectoryVersion::SupportsScatter as u32 {
            scatter_offset_cursor_position = Some(cursor.position());
            cursor.iowrite_with(self.scatter_offset.unwrap_or(0), scroll::BE)?;

            if self.version >= CodeDirectoryVersion::SupportsTeamId as u32 {
                team_offset_cursor_position = Some(cursor.position());
                cursor.iowrite_with(0u32, scroll::BE)?;

                if self.version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
                    cursor.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
                    cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;

                    if self.version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
                        cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
                        cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
                        cursor.iowrite_with(
                            self.exec_seg_flags
                                .unwrap_or_else(ExecutableSegmentFlags::empty)
                                .bits(),
                            scroll::BE,
                        )?;

                        if self.version >= CodeDirectoryVersion::SupportsRuntime as u32 {
                            cursor.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
                            cursor
                                .iowrite_with(self.pre_encrypt_offset.unwrap_or(0), scroll::BE)?;

                            if self.version >= CodeDirectoryVersion::SupportsLinkage as u32 {
                                cursor.iowrite_with(
                                    self.linkage_hash_type.unwrap_or(0),
                                    scroll::BE,
                                )?;
                                cursor.iowrite_with(
                                    self.linkage_truncated.unwrap_or(0),
                                    scroll::BE,
                                )?;
                                cursor.iowrite_with(self.spare4.unwrap_or(0), scroll::BE)?;
                                cursor
                                    .iowrite_with(self.linkage_offset.unwrap_or(0), scroll::BE)?;
                                cursor.iowrite_with(self.linkage_size.unwrap_or(0), scroll::BE)?;
                            }
                        }
                    }
                }
            }
        }

        // We've written all the struct fields. Now write variable length fields.

        let identity_offset = cursor.position();
        cursor.write_all(self.ident.as_bytes())?;
        cursor.write_all(b"\0")?;

        let team_offset = cursor.position();
        if team_offset_cursor_position.is_some() {
            if let Some(team_name) = &self.team_name {
                cursor.write_all(team_name.as_bytes())?;
                cursor.write_all(b"\0")?;
            }
        }

        // Write special digests from highest slot index down to 1; index 0
        // is the first code digest.
        for slot_index in (1..highest_slot + 1).rev() {
            let slot = CodeSigningSlot::from(slot_index);

            if let Some(hash) = self.special_hashes.get(&slot) {
                cursor.write_all(&hash.data)?;
            } else {
                cursor.write_all(&b"\0".repeat(self.hash_size as usize))?;
            }
        }

        let code_hashes_start_offset = cursor.position();

        for hash in &self.code_hashes {
            cursor.write_all(&hash.data)?;
        }

        // Now go back and update the placeholder offsets. We need to add 8
        // to account for the blob header, which isn't in this buffer.
        cursor.set_position(hash_offset_cursor_position);
        cursor.iowrite_with(code_hashes_start_offset as u32 + 8, scroll::BE)?;

        cursor.set_position(ident_offset_cursor_position);
        cursor.iowrite_with(identity_offset as u32 + 8, scroll::BE)?;

        if scatter_offset_cursor_position.is_some() && self.scatter_offset.is_some() {
            return Err(MachoIntrospectError::Unimplemented("scatter offset"));
        }

        if let Some(offset) = team_offset_cursor_position {
            if self.team_name.is_some() {
                cursor.set_position(offset);
                cursor.iowrite_with(team_offset as u32 + 8, scroll::BE)?;
            }
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    /// Compute the cdhash of this code directory.
    ///
    /// The digest covers the serialized blob, header included, using the
    /// directory's own hash algorithm, truncated to at most 20 bytes.
    /// Parsed instances digest the exact bytes they came from.
    pub fn cd_hash(&self) -> Result<Vec<u8>, MachoIntrospectError> {
        let mut digest = match &self.blob_data {
            Some(data) => self.hash_type.digest_data(data)?,
            None => self.digest_with(self.hash_type)?,
        };

        digest.truncate(20);

        Ok(digest)
    }

    /// The file offset of the page covered by a code slot.
    pub fn code_slot_page_offset(&self, slot_index: usize) -> u64 {
        slot_index as u64 * self.page_size as u64
    }

    /// Whether a code slot's digest is the digest of an all-zero page.
    pub fn is_zero_page_slot(&self, slot_index: usize) -> Result<bool, MachoIntrospectError> {
        let digest = match self.code_hashes.get(slot_index) {
            Some(digest) => digest,
            None => return Ok(false),
        };

        let mut zero = self.hash_type.zero_page_digest(self.page_size as usize)?;
        zero.truncate(self.hash_size as usize);

        Ok(digest.data.as_ref() == zero.as_slice())
    }

    /// Adjust the version of the data structure according to what fields
    /// are set, returning the old version.
    pub fn adjust_version(&mut self) -> u32 {
        let old_version = self.version;

        let mut minimum_version = CodeDirectoryVersion::Initial;

        if self.scatter_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsScatter;
        }
        if self.team_name.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsTeamId;
        }
        if self.spare3.is_some() || self.code_limit_64.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsCodeLimit64;
        }
        if self.exec_seg_base.is_some()
            || self.exec_seg_limit.is_some()
            || self.exec_seg_flags.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsExecutableSegment;
        }
        if self.runtime.is_some() || self.pre_encrypt_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsRuntime;
        }
        if self.linkage_hash_type.is_some()
            || self.linkage_truncated.is_some()
            || self.spare4.is_some()
            || self.linkage_offset.is_some()
            || self.linkage_size.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsLinkage;
        }

        self.version = minimum_version as u32;

        old_version
    }

    /// Clears optional fields that are newer than the current version.
    ///
    /// The wire structure is versioned and our struct is a superset of all
    /// versions, so fields newer than the declared version can be set
    /// without ever serializing. Calling this sets them to None.
    pub fn clear_newer_fields(&mut self) {
        if self.version < CodeDirectoryVersion::SupportsScatter as u32 {
            self.scatter_offset = None;
        }
        if self.version < CodeDirectoryVersion::SupportsTeamId as u32 {
            self.team_name = None;
        }
        if self.version < CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            self.spare3 = None;
            self.code_limit_64 = None;
        }
        if self.version < CodeDirectoryVersion::SupportsExecutableSegment as u32 {
            self.exec_seg_base = None;
            self.exec_seg_limit = None;
            self.exec_seg_flags = None;
        }
        if self.version < CodeDirectoryVersion::SupportsRuntime as u32 {
            self.runtime = None;
            self.pre_encrypt_offset = None;
        }
        if self.version < CodeDirectoryVersion::SupportsLinkage as u32 {
            self.linkage_hash_type = None;
            self.linkage_truncated = None;
            self.spare4 = None;
            self.linkage_offset = None;
            self.linkage_size = None;
        }
    }

    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            code_limit: self.code_limit,
            hash_size: self.hash_size,
            hash_type: self.hash_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: self.spare2,
            scatter_offset: self.scatter_offset,
            spare3: self.spare3,
            code_limit_64: self.code_limit_64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            runtime: self.runtime,
            pre_encrypt_offset: self.pre_encrypt_offset,
            linkage_hash_type: self.linkage_hash_type,
            linkage_truncated: self.linkage_truncated,
            spare4: self.spare4,
            linkage_offset: self.linkage_offset,
            linkage_size: self.linkage_size,
            ident: Cow::Owned(self.ident.clone().into_owned()),
            team_name: self
                .team_name
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
            code_hashes: self
                .code_hashes
                .iter()
                .map(|h| h.to_owned())
                .collect::<Vec<_>>(),
            special_hashes: self
                .special_hashes
                .iter()
                .map(|(k, v)| (*k, v.to_owned()))
                .collect::<HashMap<_, _>>(),
            pre_encrypt_hashes: self
                .pre_encrypt_hashes
                .iter()
                .map(|h| h.to_owned())
                .collect::<Vec<_>>(),
            linkage_data: self
                .linkage_data
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
            blob_data: self
                .blob_data
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with_hashes(version: CodeDirectoryVersion) -> CodeDirectoryBlob<'static> {
        let mut special_hashes = HashMap::new();
        special_hashes.insert(
            CodeSigningSlot::RequirementSet,
            Digest::from(vec![0xaa; 32]),
        );

        CodeDirectoryBlob {
            version: version as u32,
            flags: CodeSignatureFlags::ADHOC,
            code_limit: 0x3000,
            ident: "com.example.test".into(),
            code_hashes: vec![
                Digest::from(vec![0x11; 32]),
                Digest::from(vec![0x22; 32]),
                Digest::from(vec![0x33; 32]),
            ],
            special_hashes,
            ..Default::default()
        }
    }

    #[test]
    fn code_signature_flags_from_str() {
        assert_eq!(
            CodeSignatureFlags::from_str("host").unwrap(),
            CodeSignatureFlags::HOST
        );
        assert_eq!(
            CodeSignatureFlags::from_str("hard").unwrap(),
            CodeSignatureFlags::FORCE_HARD
        );
        assert_eq!(
            CodeSignatureFlags::from_str("runtime").unwrap(),
            CodeSignatureFlags::RUNTIME
        );
        assert_eq!(
            CodeSignatureFlags::from_str("linker-signed").unwrap(),
            CodeSignatureFlags::LINKER_SIGNED
        );
        assert!(CodeSignatureFlags::from_str("bogus").is_err());
    }

    #[test]
    fn roundtrip_earliest_version() {
        // An earliest-version directory has no tail fields at all.
        let mut cd = directory_with_hashes(CodeDirectoryVersion::SupportsScatter);
        cd.version = CODE_DIRECTORY_EARLIEST_VERSION;

        let blob = cd.to_blob_bytes().unwrap();
        let parsed = CodeDirectoryBlob::from_blob_bytes(&blob).unwrap();

        assert_eq!(parsed.version, CODE_DIRECTORY_EARLIEST_VERSION);
        assert_eq!(parsed.ident, "com.example.test");
        assert!(parsed.scatter_offset.is_none());
        assert!(parsed.team_name.is_none());
        assert!(parsed.code_limit_64.is_none());
        assert!(parsed.exec_seg_base.is_none());
        assert_eq!(parsed.code_hashes, cd.code_hashes);
        assert_eq!(
            parsed.special_hashes.get(&CodeSigningSlot::RequirementSet),
            cd.special_hashes.get(&CodeSigningSlot::RequirementSet)
        );
    }

    #[test]
    fn roundtrip_exec_seg_version() {
        let mut cd = directory_with_hashes(CodeDirectoryVersion::SupportsExecutableSegment);
        cd.exec_seg_base = Some(0);
        cd.exec_seg_limit = Some(0x4000);
        cd.exec_seg_flags = Some(ExecutableSegmentFlags::MAIN_BINARY);
        cd.team_name = Some("TEAM12345".into());

        let blob = cd.to_blob_bytes().unwrap();
        let parsed = CodeDirectoryBlob::from_blob_bytes(&blob).unwrap();

        assert_eq!(parsed.team_name.as_deref(), Some("TEAM12345"));
        assert_eq!(parsed.exec_seg_limit, Some(0x4000));
        assert_eq!(
            parsed.exec_seg_flags,
            Some(ExecutableSegmentFlags::MAIN_BINARY)
        );
    }

    #[test]
    fn cd_hash_covers_serialized_bytes() {
        let cd = directory_with_hashes(CodeDirectoryVersion::SupportsExecutableSegment);

        let blob = cd.to_blob_bytes().unwrap();
        let parsed = CodeDirectoryBlob::from_blob_bytes(&blob).unwrap();

        let expected = {
            let mut digest = DigestType::Sha256.digest_data(&blob).unwrap();
            digest.truncate(20);
            digest
        };

        assert_eq!(parsed.cd_hash().unwrap(), expected);
        assert_eq!(parsed.cd_hash().unwrap().len(), 20);
        // Constructed instances digest their serialization, which matches.
        assert_eq!(cd.cd_hash().unwrap(), expected);
    }

    #[test]
    fn code_slot_page_offsets() {
        let cd = directory_with_hashes(CodeDirectoryVersion::SupportsExecutableSegment);

        assert_eq!(cd.code_slot_page_offset(0), 0);
        assert_eq!(cd.code_slot_page_offset(2), 0x2000);
    }

    #[test]
    fn zero_page_slot_detection() {
        let mut cd = directory_with_hashes(CodeDirectoryVersion::SupportsExecutableSegment);

        let zero_digest = DigestType::Sha256.zero_page_digest(4096).unwrap();
        cd.code_hashes[1] = Digest::from(zero_digest);

        assert!(!cd.is_zero_page_slot(0).unwrap());
        assert!(cd.is_zero_page_slot(1).unwrap());
        assert!(!cd.is_zero_page_slot(99).unwrap());
    }

    #[test]
    fn adjust_version_tracks_fields() {
        let mut cd = CodeDirectoryBlob {
            team_name: Some("TEAM".into()),
            ..Default::default()
        };

        cd.adjust_version();
        assert_eq!(cd.version, CodeDirectoryVersion::SupportsTeamId as u32);

        cd.exec_seg_base = Some(0);
        cd.adjust_version();
        assert_eq!(
            cd.version,
            CodeDirectoryVersion::SupportsExecutableSegment as u32
        );
    }

    #[test]
    fn truncated_hash_arrays_error() {
        let cd = directory_with_hashes(CodeDirectoryVersion::SupportsExecutableSegment);
        let mut blob = cd.to_blob_bytes().unwrap();

        // Chop the final code hash off, fixing up the declared length so
        // the outer blob still reads.
        let new_len = blob.len() - 16;
        blob.truncate(new_len);
        blob[4..8].copy_from_slice(&(new_len as u32).to_be_bytes());

        assert!(matches!(
            CodeDirectoryBlob::from_blob_bytes(&blob),
            Err(MachoIntrospectError::CodeDirectoryHashesOutOfBounds(_, _))
        ));
    }
}
