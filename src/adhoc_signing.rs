// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ad-hoc signature generation.
//!
//! An ad-hoc signature seals a code image without a signing identity: a
//! SuperBlob holding a single CodeDirectory whose code slots are SHA-256
//! digests of successive pages. There is no CMS signature and nothing to
//! verify against a certificate chain; the kernel trusts the digests
//! themselves.

use {
    crate::{
        code_directory::{CodeDirectoryBlob, CodeSignatureFlags, ExecutableSegmentFlags},
        embedded_signature::{
            create_superblob, Blob, CodeSigningMagic, CodeSigningSlot, Digest, DigestType,
        },
        error::MachoIntrospectError,
    },
    log::info,
};

/// Produces ad-hoc code signatures over pre-formed code images.
///
/// The image is everything up to where the signature itself will live,
/// already laid out by the caller. Page digests cover the image as given;
/// the final partial page is digested short, not zero-padded.
#[derive(Clone, Debug)]
pub struct AdhocSigner {
    identifier: String,
    page_size: u32,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    main_binary: bool,
}

impl AdhocSigner {
    pub fn new(identifier: impl ToString) -> Self {
        Self {
            identifier: identifier.to_string(),
            page_size: 4096,
            exec_seg_base: 0,
            exec_seg_limit: 0,
            main_binary: false,
        }
    }

    /// Set the page size used for code digests. Defaults to 4096.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Declare the executable (`__TEXT`) segment's file offset and size.
    pub fn executable_segment(mut self, base: u64, limit: u64) -> Self {
        self.exec_seg_base = base;
        self.exec_seg_limit = limit;
        self
    }

    /// Mark the signed image as a main executable rather than a library.
    pub fn main_binary(mut self, main_binary: bool) -> Self {
        self.main_binary = main_binary;
        self
    }

    /// Produce SuperBlob bytes sealing `image`.
    pub fn sign(&self, image: &[u8]) -> Result<Vec<u8>, MachoIntrospectError> {
        if self.identifier.is_empty() {
            return Err(MachoIntrospectError::NoIdentifier);
        }

        // The trailing chunk digests at whatever length remains; code
        // slots never cover padding the image doesn't have.
        let code_hashes = image
            .chunks(self.page_size as usize)
            .map(|page| Ok(Digest::from(DigestType::Sha256.digest_data(page)?)))
            .collect::<Result<Vec<_>, MachoIntrospectError>>()?;

        info!(
            "ad-hoc signing {} bytes as {} ({} code slots)",
            image.len(),
            self.identifier,
            code_hashes.len()
        );

        let exec_seg_flags = if self.main_binary {
            ExecutableSegmentFlags::MAIN_BINARY
        } else {
            ExecutableSegmentFlags::empty()
        };

        let code_directory = CodeDirectoryBlob {
            flags: CodeSignatureFlags::ADHOC,
            code_limit: image.len() as u32,
            hash_size: DigestType::Sha256.hash_len()? as u8,
            hash_type: DigestType::Sha256,
            page_size: self.page_size,
            ident: self.identifier.clone().into(),
            code_hashes,
            exec_seg_base: Some(self.exec_seg_base),
            exec_seg_limit: Some(self.exec_seg_limit),
            exec_seg_flags: Some(exec_seg_flags),
            ..Default::default()
        };

        let blobs = vec![(
            CodeSigningSlot::CodeDirectory,
            code_directory.to_blob_bytes()?,
        )];

        create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::embedded_signature::CodeSignature,
    };

    #[test]
    fn sign_requires_identifier() {
        assert!(matches!(
            AdhocSigner::new("").sign(&[0u8; 16]),
            Err(MachoIntrospectError::NoIdentifier)
        ));
    }

    #[test]
    fn sign_and_reparse_roundtrip() {
        let image = (0..10240u32).map(|v| v as u8).collect::<Vec<_>>();

        let superblob = AdhocSigner::new("com.example.adhoc")
            .executable_segment(0, 0x1000)
            .main_binary(true)
            .sign(&image)
            .unwrap();

        let signature = CodeSignature::parse(&superblob).unwrap();
        assert!(signature.errors.is_empty());

        let cd = signature.code_directory.unwrap();

        assert_eq!(cd.ident, "com.example.adhoc");
        assert!(cd.flags.contains(CodeSignatureFlags::ADHOC));
        assert_eq!(cd.code_limit, 10240);
        assert_eq!(
            cd.exec_seg_flags,
            Some(ExecutableSegmentFlags::MAIN_BINARY)
        );

        // 10 KB at 4 KB pages is 3 slots; the last covers only 2 KB.
        assert_eq!(cd.code_hashes.len(), 3);
        assert_eq!(
            cd.code_hashes[0].data.as_ref(),
            DigestType::Sha256
                .digest_data(&image[0..4096])
                .unwrap()
                .as_slice()
        );
        assert_eq!(
            cd.code_hashes[2].data.as_ref(),
            DigestType::Sha256
                .digest_data(&image[8192..])
                .unwrap()
                .as_slice()
        );
    }

    #[test]
    fn exact_page_multiple_has_no_short_slot() {
        let image = vec![0xaa; 8192];

        let superblob = AdhocSigner::new("com.example.exact").sign(&image).unwrap();
        let signature = CodeSignature::parse(&superblob).unwrap();
        let cd = signature.code_directory.unwrap();

        assert_eq!(cd.code_hashes.len(), 2);
        assert_eq!(
            cd.code_hashes[1].data.as_ref(),
            DigestType::Sha256
                .digest_data(&image[4096..])
                .unwrap()
                .as_slice()
        );
    }

    #[test]
    fn custom_page_size() {
        let image = vec![0x55; 3000];

        let superblob = AdhocSigner::new("com.example.small")
            .page_size(1024)
            .sign(&image)
            .unwrap();
        let signature = CodeSignature::parse(&superblob).unwrap();
        let cd = signature.code_directory.unwrap();

        assert_eq!(cd.page_size, 1024);
        assert_eq!(cd.code_hashes.len(), 3);
    }
}
