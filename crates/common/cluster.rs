//! Subcluster configuration and the persisted record that ties a logical
//! deployment of vats together for reload and termination.

use crate::refs::{KRef, VatId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};
use std::str::FromStr;

/// Identifier of a subcluster (`s<N>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubclusterId(pub u64);

impl Display for SubclusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl FromStr for SubclusterId {
    type Err = crate::refs::RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::refs::RefError::EmptyReference);
        }
        s.strip_prefix('s')
            .and_then(|digits| digits.parse::<u64>().ok())
            .map(SubclusterId)
            .ok_or_else(|| crate::refs::RefError::InvalidReference(s.to_string()))
    }
}

impl Serialize for SubclusterId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SubclusterId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One vat within a subcluster config: a logical name, the bundle the worker
/// factory should launch, and free-form launch parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatConfig {
    pub name: String,
    pub bundle: String,
    #[serde(default)]
    pub parameters: Value,
}

/// A configured group of vats bootstrapped together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubclusterConfig {
    /// Logical name of the vat that receives the synthetic `bootstrap`
    /// delivery. Must name an entry in `vats`.
    pub bootstrap: String,
    pub vats: Vec<VatConfig>,
    /// Kernel service names made available to the bootstrap vat.
    #[serde(default)]
    pub services: Vec<String>,
    /// Discard any persisted state for this subcluster before launching.
    #[serde(default, rename = "forceReset")]
    pub force_reset: bool,
}

impl SubclusterConfig {
    pub fn vat_named(&self, name: &str) -> Option<&VatConfig> {
        self.vats.iter().find(|vat| vat.name == name)
    }
}

/// Persisted per-vat state: how to relaunch the worker and which kernel
/// object is its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatRecord {
    pub name: String,
    pub bundle: String,
    #[serde(default)]
    pub parameters: Value,
    pub subcluster: SubclusterId,
    pub root: KRef,
}

/// Persisted subcluster state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubclusterRecord {
    pub id: SubclusterId,
    pub bootstrap_vat: VatId,
    /// Launch order matters: bootstrap arguments list roots in this order.
    pub vats: Vec<(String, VatId)>,
    pub services: Vec<String>,
    pub config: SubclusterConfig,
}

impl SubclusterRecord {
    pub fn vat_ids(&self) -> Vec<VatId> {
        self.vats.iter().map(|(_, id)| *id).collect()
    }

    pub fn contains_vat(&self, vat: VatId) -> bool {
        self.vats.iter().any(|(_, id)| *id == vat)
    }
}
