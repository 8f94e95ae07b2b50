// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Unified error type for Mach-O introspection.
#[derive(Debug, Error)]
pub enum MachoIntrospectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("invalid Mach-O binary: {0}")]
    InvalidBinary(String),

    #[error("binary does not have code signature data")]
    BinaryNoCodeSignature,

    #[error("unable to locate __LINKEDIT segment")]
    MissingLinkedit,

    #[error("read of {length} bytes at offset {offset} exceeds source size {size}")]
    ReadOutOfBounds {
        offset: u64,
        length: usize,
        size: u64,
    },

    #[error("chained fixups data truncated at offset {0}; expected {1}")]
    FixupsTruncated(usize, &'static str),

    #[error("unknown chained pointer format: {0}")]
    UnknownPointerFormat(u16),

    #[error("unknown chained import format: {0}")]
    UnknownImportFormat(u32),

    #[error("compressed symbols pool (format {0}) is not supported")]
    UnsupportedSymbolsFormat(u32),

    #[error("import name offset {0} is outside the symbols pool")]
    SymbolsPoolOverrun(u32),

    #[error("page start overflow index {0} exceeds starts array of {1} entries")]
    PageStartOverflow(usize, usize),

    #[error("file offset {0} is not covered by any chained fixups segment")]
    OffsetOutsideSegments(u64),

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("SuperBlob data is malformed")]
    SuperblobMalformed,

    #[error("malformed identifier string in code directory")]
    CodeDirectoryMalformedIdentifier,

    #[error("malformed team name string in code directory")]
    CodeDirectoryMalformedTeam,

    #[error("code directory hash array at {0} exceeds blob of {1} bytes")]
    CodeDirectoryHashesOutOfBounds(usize, usize),

    #[error("entitlements data not valid UTF-8: {0}")]
    EntitlementsBadUtf8(std::str::Utf8Error),

    #[error("error parsing plist XML: {0}")]
    PlistParseXml(plist::Error),

    #[error("error serializing plist to XML: {0}")]
    PlistSerializeXml(plist::Error),

    #[error("unknown code requirement opcode: {0}")]
    RequirementUnknownOpcode(u32),

    #[error("unknown code requirement match expression: {0}")]
    RequirementUnknownMatchExpression(u32),

    #[error("code requirement data malformed: {0}")]
    RequirementMalformed(&'static str),

    #[error("unknown code signature flag: {0}")]
    CodeSignatureUnknownFlag(String),

    #[error("unknown executable segment flag: {0}")]
    ExecutableSegmentUnknownFlag(String),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,

    #[error("unsupported digest algorithm")]
    DigestUnsupportedAlgorithm,

    #[error("no identifier string provided")]
    NoIdentifier,

    #[error("functionality not implemented: {0}")]
    Unimplemented(&'static str),
}
