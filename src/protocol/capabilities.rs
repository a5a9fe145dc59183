//! Capabilities advertised in hello messages.
//!
//! A capability is a URI. Base capabilities select the protocol version
//! and framing; module capabilities (`<namespace>?module=<name>&revision=<date>`)
//! name supported YANG modules and feed the monitoring schema list.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::FramingMode;
use crate::error::{NetconfError, Result};

/// NETCONF 1.0 base capability (end-of-message framing).
pub const BASE_1_0: &str = "urn:ietf:params:netconf:base:1.0";

/// NETCONF 1.1 base capability (chunked framing).
pub const BASE_1_1: &str = "urn:ietf:params:netconf:base:1.1";

/// Candidate configuration capability.
pub const CANDIDATE_1_0: &str = "urn:ietf:params:netconf:capability:candidate:1.0";

/// Event notification capability (RFC 5277).
pub const NOTIFICATION_1_0: &str = "urn:ietf:params:netconf:capability:notification:1.0";

/// A single capability URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    /// Create capability from a URI; surrounding whitespace is dropped.
    pub fn new(uri: impl AsRef<str>) -> Self {
        Self(uri.as_ref().trim().to_string())
    }

    /// The capability URI.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is one of the base protocol capabilities.
    pub fn is_base(&self) -> bool {
        self.0 == BASE_1_0 || self.0 == BASE_1_1
    }

    /// Module information, if this is a YANG module capability.
    pub fn module(&self) -> Option<ModuleCapability> {
        let (namespace, query) = self.0.split_once('?')?;
        let mut module = None;
        let mut revision = None;
        let mut features = Vec::new();
        let mut deviations = Vec::new();

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key {
                "module" => module = Some(value.to_string()),
                "revision" => revision = Some(value.to_string()),
                "features" => features = split_list(value),
                "deviations" => deviations = split_list(value),
                _ => {},
            }
        }

        Some(ModuleCapability {
            namespace: namespace.to_string(),
            name: module.filter(|m| !m.is_empty())?,
            revision,
            features,
            deviations,
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for Capability {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

/// YANG module named by a module capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCapability {
    /// Module namespace URI
    pub namespace: String,
    /// Module name
    pub name: String,
    /// Revision date
    pub revision: Option<String>,
    /// Enabled features
    pub features: Vec<String>,
    /// Deviation modules
    pub deviations: Vec<String>,
}

/// Unordered, duplicate-free set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Create empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Both base capabilities (1.0 and 1.1).
    pub fn base() -> Self {
        [BASE_1_0, BASE_1_1].into_iter().collect()
    }

    /// Add a capability; returns false if it was already present.
    pub fn insert(&mut self, capability: impl Into<Capability>) -> bool {
        self.0.insert(capability.into())
    }

    /// Remove a capability; returns false if it was absent.
    pub fn remove(&mut self, capability: &Capability) -> bool {
        self.0.remove(capability)
    }

    /// Check membership by URI
    pub fn contains(&self, uri: &str) -> bool {
        self.0.contains(&Capability::new(uri))
    }

    /// Number of capabilities
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in URI order
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Capabilities present in both sets
    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    /// Capabilities present in either set
    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Capabilities in `self` but not in `other`
    pub fn difference(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    /// Whether any base capability is advertised
    pub fn has_base(&self) -> bool {
        self.0.iter().any(Capability::is_base)
    }

    /// Module capabilities in the set
    pub fn modules(&self) -> Vec<ModuleCapability> {
        self.0.iter().filter_map(Capability::module).collect()
    }

    /// Negotiate a session with the peer's advertised set.
    ///
    /// The peers must share a base capability. Chunked framing is used
    /// only when both advertise base:1.1.
    pub fn negotiate(&self, peer: &CapabilitySet) -> Result<NegotiatedCaps> {
        if peer.is_empty() {
            return Err(NetconfError::NegotiationFailed(
                "peer advertised no capabilities".to_string(),
            ));
        }
        let common = self.intersection(peer);
        if !common.has_base() {
            return Err(NetconfError::NegotiationFailed(
                "no common base capability".to_string(),
            ));
        }
        let framing = if common.contains(BASE_1_1) {
            FramingMode::Chunked
        } else {
            FramingMode::EndOfMessage
        };
        Ok(NegotiatedCaps { framing, common })
    }
}

impl<C: Into<Capability>> FromIterator<C> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a Capability;
    type IntoIter = std::collections::btree_set::Iter<'a, Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Result of capability negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCaps {
    /// Framing used after the hello exchange
    pub framing: FramingMode,
    /// Capabilities both peers advertised
    pub common: CapabilitySet,
}
