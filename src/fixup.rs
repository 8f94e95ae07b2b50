// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed chained fixup records and the raw pointer classifier.

use crate::pointer_format::PointerFormat;

/// ARM64e pointer authentication key selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PointerKey {
    IA,
    IB,
    DA,
    DB,
}

impl From<u8> for PointerKey {
    fn from(v: u8) -> Self {
        match v & 0b11 {
            0 => Self::IA,
            1 => Self::IB,
            2 => Self::DA,
            _ => Self::DB,
        }
    }
}

impl std::fmt::Display for PointerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IA => f.write_str("IA"),
            Self::IB => f.write_str("IB"),
            Self::DA => f.write_str("DA"),
            Self::DB => f.write_str("DB"),
        }
    }
}

/// A pointer slot rewritten to point within the image itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rebase {
    /// File offset of the pointer word.
    pub location: u64,

    /// Runtime offset of the rebase target from the image base.
    ///
    /// Formats encoding vm addresses have already been rebased against the
    /// preferred load address; offset formats pass through.
    pub target: u64,

    /// Top byte of the final pointer, carried out of line by 64-bit
    /// formats so tagged pointers survive rebasing.
    pub high8: u8,

    /// Kernel collection level, for kernel-cache formats.
    pub cache_level: Option<u8>,

    /// Offset to the next chain entry, in strides. 0 ends the chain.
    pub next: u32,
}

/// A pointer slot resolved against an imported symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bind {
    /// File offset of the pointer word.
    pub location: u64,

    /// Index into the imports table.
    pub ordinal: u32,

    /// Inline addend applied to the bound address.
    pub addend: i64,

    /// Resolved import name. Empty when the ordinal does not resolve.
    pub name: String,

    /// Offset to the next chain entry, in strides. 0 ends the chain.
    pub next: u32,
}

/// An authenticated rebase carrying ARM64e PAC metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthRebase {
    /// File offset of the pointer word.
    pub location: u64,

    /// Runtime offset of the rebase target from the image base.
    pub target: u64,

    /// Extra discriminator mixed into the authentication code.
    pub diversity: u16,

    /// Whether the slot's address is blended into the discriminator.
    pub addr_div: bool,

    /// Authentication key used to sign the pointer.
    pub key: PointerKey,

    /// Kernel collection level, for kernel-cache formats.
    pub cache_level: Option<u8>,

    /// Offset to the next chain entry, in strides. 0 ends the chain.
    pub next: u32,
}

/// An authenticated bind carrying ARM64e PAC metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthBind {
    /// File offset of the pointer word.
    pub location: u64,

    /// Index into the imports table.
    pub ordinal: u32,

    /// Resolved import name. Empty when the ordinal does not resolve.
    pub name: String,

    /// Extra discriminator mixed into the authentication code.
    pub diversity: u16,

    /// Whether the slot's address is blended into the discriminator.
    pub addr_div: bool,

    /// Authentication key used to sign the pointer.
    pub key: PointerKey,

    /// Offset to the next chain entry, in strides. 0 ends the chain.
    pub next: u32,
}

/// One decoded chain entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainedFixup {
    Rebase(Rebase),
    Bind(Bind),
    AuthRebase(AuthRebase),
    AuthBind(AuthBind),
}

impl ChainedFixup {
    /// File offset of the pointer word this fixup was decoded from.
    pub fn location(&self) -> u64 {
        match self {
            Self::Rebase(f) => f.location,
            Self::Bind(f) => f.location,
            Self::AuthRebase(f) => f.location,
            Self::AuthBind(f) => f.location,
        }
    }

    /// Offset to the next chain entry, in strides.
    pub fn next(&self) -> u32 {
        match self {
            Self::Rebase(f) => f.next,
            Self::Bind(f) => f.next,
            Self::AuthRebase(f) => f.next,
            Self::AuthBind(f) => f.next,
        }
    }

    /// Whether this fixup binds to an imported symbol.
    pub fn is_bind(&self) -> bool {
        matches!(self, Self::Bind(_) | Self::AuthBind(_))
    }

    /// The bind ordinal, if this fixup is a bind.
    pub fn bind_ordinal(&self) -> Option<u32> {
        match self {
            Self::Bind(f) => Some(f.ordinal),
            Self::AuthBind(f) => Some(f.ordinal),
            _ => None,
        }
    }

    /// The rebase target, if this fixup is a rebase.
    pub fn rebase_target(&self) -> Option<u64> {
        match self {
            Self::Rebase(f) => Some(f.target),
            Self::AuthRebase(f) => Some(f.target),
            _ => None,
        }
    }

    pub(crate) fn set_bind_name(&mut self, name: String) {
        match self {
            Self::Bind(f) => f.name = name,
            Self::AuthBind(f) => f.name = name,
            _ => {}
        }
    }
}

/// Classify a raw pointer word into a typed fixup.
///
/// `location` is the file offset the word was read from and is recorded on
/// the returned fixup. `preferred_load_address` is subtracted from rebase
/// targets for formats that encode vm addresses; offset formats pass their
/// target through untouched.
///
/// The four `{bind} x {auth}` combinations are decoded as disjoint cases.
/// Formats incapable of binds or authentication never produce those
/// variants because the corresponding flag bits do not exist in their
/// layouts.
pub fn decode_pointer(
    format: PointerFormat,
    location: u64,
    raw: u64,
    preferred_load_address: u64,
) -> ChainedFixup {
    let info = format.info();
    let layout = &info.layout;

    let next = layout.next.extract(raw) as u32;
    let is_auth = layout
        .auth_flag
        .map(|f| f.extract(raw) != 0)
        .unwrap_or(false);
    let is_bind = layout
        .bind_flag
        .map(|f| f.extract(raw) != 0)
        .unwrap_or(false);

    let diversity = || layout.diversity.map(|f| f.extract(raw) as u16).unwrap_or(0);
    let addr_div = || layout.addr_div.map(|f| f.extract(raw) != 0).unwrap_or(false);
    let key = || PointerKey::from(layout.key.map(|f| f.extract(raw) as u8).unwrap_or(0));
    let cache_level = layout.cache_level.map(|f| f.extract(raw) as u8);

    match (is_auth, is_bind) {
        (true, true) => ChainedFixup::AuthBind(AuthBind {
            location,
            ordinal: layout.ordinal.map(|f| f.extract(raw) as u32).unwrap_or(0),
            name: String::new(),
            diversity: diversity(),
            addr_div: addr_div(),
            key: key(),
            next,
        }),
        (true, false) => ChainedFixup::AuthRebase(AuthRebase {
            location,
            target: layout
                .auth_target
                .map(|f| f.extract(raw))
                .unwrap_or_else(|| layout.target.extract(raw)),
            diversity: diversity(),
            addr_div: addr_div(),
            key: key(),
            cache_level,
            next,
        }),
        (false, true) => {
            let addend = match layout.addend {
                Some(f) if info.bind_addend_signed => f.extract_signed(raw),
                Some(f) => f.extract(raw) as i64,
                None => 0,
            };

            ChainedFixup::Bind(Bind {
                location,
                ordinal: layout.ordinal.map(|f| f.extract(raw) as u32).unwrap_or(0),
                addend,
                name: String::new(),
                next,
            })
        }
        (false, false) => {
            let target = layout.target.extract(raw);
            let target = if info.rebase_target_is_vm_addr {
                target.wrapping_sub(preferred_load_address)
            } else {
                target
            };

            ChainedFixup::Rebase(Rebase {
                location,
                target,
                high8: layout.high8.map(|f| f.extract(raw) as u8).unwrap_or(0),
                cache_level,
                next,
            })
        }
    }
}
