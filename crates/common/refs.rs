//! Typed reference identifiers.
//!
//! Every cross-vat reference at the kernel layer is a [`KRef`] (`ko<N>` for
//! objects, `kp<N>` for promises). Each vat names the same entity through its
//! own [`VRef`] (`o+`/`p+` for exports it allocated, `o-`/`p-` for imports it
//! received); the c-list in the store ties the two together. Krefs are never
//! reused after retirement.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt::{self, Display};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefError {
    #[error("empty reference")]
    EmptyReference,
    #[error("invalid reference `{0}`")]
    InvalidReference(String),
}

/// Kernel-wide reference to an object or a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KRef {
    Object(u64),
    Promise(u64),
}

impl KRef {
    pub const fn is_object(&self) -> bool {
        matches!(self, KRef::Object(_))
    }

    pub const fn is_promise(&self) -> bool {
        matches!(self, KRef::Promise(_))
    }

    pub const fn index(&self) -> u64 {
        match self {
            KRef::Object(n) | KRef::Promise(n) => *n,
        }
    }
}

impl Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KRef::Object(n) => write!(f, "ko{n}"),
            KRef::Promise(n) => write!(f, "kp{n}"),
        }
    }
}

impl FromStr for KRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RefError::EmptyReference);
        }
        let parse_index = |digits: &str| {
            digits
                .parse::<u64>()
                .map_err(|_| RefError::InvalidReference(s.to_string()))
        };
        if let Some(digits) = s.strip_prefix("ko") {
            Ok(KRef::Object(parse_index(digits)?))
        } else if let Some(digits) = s.strip_prefix("kp") {
            Ok(KRef::Promise(parse_index(digits)?))
        } else {
            Err(RefError::InvalidReference(s.to_string()))
        }
    }
}

/// A vat's local-space name for a kernel reference.
///
/// `allocated_by_vat` is true for `o+`/`p+` references (the vat exported the
/// entity) and false for `o-`/`p-` references (the kernel imported it into
/// the vat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VRef {
    Object { index: u64, allocated_by_vat: bool },
    Promise { index: u64, allocated_by_vat: bool },
}

impl VRef {
    pub const fn export_object(index: u64) -> Self {
        VRef::Object {
            index,
            allocated_by_vat: true,
        }
    }

    pub const fn import_object(index: u64) -> Self {
        VRef::Object {
            index,
            allocated_by_vat: false,
        }
    }

    pub const fn export_promise(index: u64) -> Self {
        VRef::Promise {
            index,
            allocated_by_vat: true,
        }
    }

    pub const fn import_promise(index: u64) -> Self {
        VRef::Promise {
            index,
            allocated_by_vat: false,
        }
    }

    pub const fn is_promise(&self) -> bool {
        matches!(self, VRef::Promise { .. })
    }

    pub const fn allocated_by_vat(&self) -> bool {
        match self {
            VRef::Object {
                allocated_by_vat, ..
            }
            | VRef::Promise {
                allocated_by_vat, ..
            } => *allocated_by_vat,
        }
    }

    /// The conventional root object every vat exports at launch.
    pub const ROOT_OBJECT: VRef = VRef::export_object(0);
}

impl Display for VRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (tag, index, plus) = match self {
            VRef::Object {
                index,
                allocated_by_vat,
            } => ('o', index, allocated_by_vat),
            VRef::Promise {
                index,
                allocated_by_vat,
            } => ('p', index, allocated_by_vat),
        };
        let sign = if *plus { '+' } else { '-' };
        write!(f, "{tag}{sign}{index}")
    }
}

impl FromStr for VRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RefError::EmptyReference);
        }
        let mut chars = s.chars();
        let tag = chars.next();
        let sign = chars.next();
        let allocated_by_vat = match sign {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(RefError::InvalidReference(s.to_string())),
        };
        let index = chars
            .as_str()
            .parse::<u64>()
            .map_err(|_| RefError::InvalidReference(s.to_string()))?;
        match tag {
            Some('o') => Ok(VRef::Object {
                index,
                allocated_by_vat,
            }),
            Some('p') => Ok(VRef::Promise {
                index,
                allocated_by_vat,
            }),
            _ => Err(RefError::InvalidReference(s.to_string())),
        }
    }
}

/// Identifier of an isolated execution container (`v<N>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VatId(pub u64);

impl Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VatId {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RefError::EmptyReference);
        }
        s.strip_prefix('v')
            .and_then(|digits| digits.parse::<u64>().ok())
            .map(VatId)
            .ok_or_else(|| RefError::InvalidReference(s.to_string()))
    }
}

/// Who answers for a kernel object: a local vat, the kernel itself (service
/// objects), or a remote kernel reached through comms.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointId {
    Vat(VatId),
    Kernel,
    Remote(String),
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Vat(vat) => write!(f, "{vat}"),
            EndpointId::Kernel => write!(f, "kernel"),
            EndpointId::Remote(peer) => write!(f, "remote:{peer}"),
        }
    }
}

impl FromStr for EndpointId {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RefError::EmptyReference);
        }
        if s == "kernel" {
            Ok(EndpointId::Kernel)
        } else if let Some(peer) = s.strip_prefix("remote:") {
            Ok(EndpointId::Remote(peer.to_string()))
        } else {
            Ok(EndpointId::Vat(s.parse()?))
        }
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

string_serde!(KRef);
string_serde!(VRef);
string_serde!(VatId);
string_serde!(EndpointId);
