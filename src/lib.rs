// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O binary introspection: dyld chained fixups and code signatures.
//!
//! This crate deeply parses the two hardest corners of the Mach-O format:
//!
//! * **Chained fixups**: the bit-packed pointer chains dyld rewrites at
//!   page-in time. The [ChainedFixups] engine walks every chain of every
//!   segment into typed [ChainedFixup] records, resolves single file
//!   offsets without a full walk, and classifies raw pointer words against
//!   any of the dozen [PointerFormat] encodings (including ARM64e
//!   authenticated pointers).
//! * **Code signatures**: the SuperBlob embedded in `__LINKEDIT`.
//!   [EmbeddedSignature] locates blobs; [CodeSignature] deeply parses
//!   them: versioned [CodeDirectoryBlob] structures with their hash slot
//!   arrays and cdhash, requirement expression trees rendered to Apple's
//!   requirement language, and entitlements in both XML and DER forms.
//!
//! Signature *generation* is limited to ad-hoc signing ([AdhocSigner]):
//! SHA-256 page digests over a pre-formed image, no CMS. Verifying
//! cryptographic signatures against a certificate chain is out of scope;
//! the CMS blob is exposed as raw bytes.
//!
//! The core operates on an abstract [ByteSource] plus a [SegmentMap]
//! supplied by the outer Mach-O layer. The [macho] module bridges from a
//! goblin-parsed binary:
//!
//! ```no_run
//! use macho_introspect::{chained_fixups_engine, code_signature};
//!
//! let data = std::fs::read("/usr/bin/true")?;
//! let macho = goblin::mach::MachO::parse(&data, 0)?;
//!
//! if let Some(mut fixups) = chained_fixups_engine(&macho, &data)? {
//!     for fixup in fixups.fixups()? {
//!         println!("{:x}: {:?}", fixup.location(), fixup);
//!     }
//! }
//!
//! if let Some(signature) = code_signature(&macho)? {
//!     if let Some(cd) = signature.code_directory()? {
//!         println!("{} cdhash {}", cd.ident, hex::encode(cd.cd_hash()?));
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod adhoc_signing;
pub use adhoc_signing::*;
pub mod chained_fixups;
pub use chained_fixups::*;
mod code_directory;
pub use code_directory::*;
pub mod code_requirement;
pub use code_requirement::*;
pub mod embedded_signature;
pub use embedded_signature::*;
pub mod entitlements;
mod error;
pub use error::*;
pub mod fixup;
pub use fixup::*;
mod macho;
pub use macho::*;
pub mod pointer_format;
pub use pointer_format::*;
mod reader;
pub use reader::*;
