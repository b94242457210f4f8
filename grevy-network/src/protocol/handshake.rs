//! The handshake mini-protocol: version negotiation.
//!
//! The first traffic on every connection. The client proposes a version map,
//! the server either accepts the best common version, answers a query with
//! its own map, or refuses.

pub mod message;
pub mod server;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use thiserror::Error;

pub use message::{Message, RefuseReason, VersionData, VersionMap};
pub use server::HandshakeHandler;

/// The outcome of a successful negotiation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeResult {
    /// The agreed protocol version.
    pub version: u64,
    /// The agreed parameters for that version.
    pub data: VersionData,
}

/// The error returned for a version table whose promoted version is missing.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("the promoted version is not in the known version list")]
pub struct InvalidVersionTable;

/// The versions a node offers, with a designated promoted version quoted in
/// refusals.
#[derive(Clone, Debug)]
pub struct VersionTable {
    versions: VersionMap,
    promoted: u64,
}

impl VersionTable {
    /// Builds a table, checking that the promoted version is listed.
    pub fn new(versions: VersionMap, promoted: u64) -> Result<Self, InvalidVersionTable> {
        if !versions.contains_key(&promoted) {
            return Err(InvalidVersionTable);
        }
        Ok(VersionTable { versions, promoted })
    }

    /// The version quoted in refusals.
    pub fn promoted(&self) -> u64 {
        self.promoted
    }

    /// The parameters offered for `version`, if it is listed.
    pub fn get(&self, version: u64) -> Option<&VersionData> {
        self.versions.get(&version)
    }

    /// Whether `version` is listed.
    pub fn contains(&self, version: u64) -> bool {
        self.versions.contains_key(&version)
    }

    /// The full version map, as sent in query replies.
    pub fn versions(&self) -> &VersionMap {
        &self.versions
    }

    /// The listed version numbers, ascending.
    pub fn version_numbers(&self) -> Vec<u64> {
        self.versions.keys().copied().collect()
    }
}

/// Builds the version map a client proposes for `versions`, advertising
/// initiator-only diffusion as servers require.
pub fn client_proposal(
    versions: impl IntoIterator<Item = u64>,
    network_magic: u32,
) -> VersionMap {
    versions
        .into_iter()
        .map(|v| {
            (
                v,
                VersionData {
                    network_magic,
                    initiator_only_diffusion: true,
                    peer_sharing: 0,
                    query: false,
                },
            )
        })
        .collect::<BTreeMap<_, _>>()
}
