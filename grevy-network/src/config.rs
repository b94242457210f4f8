//! Configuration for networking code.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::constants::RECOGNIZED_VERSIONS;

/// Configuration for the networking engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The address the server listens on, as `address:port`.
    ///
    /// `address` can be an IP address or a DNS name. DNS names are resolved
    /// once, when the server starts up.
    pub listen_addr: String,

    /// The lowest protocol version offered and accepted.
    pub version_min: u64,

    /// The highest protocol version offered and accepted.
    ///
    /// This is also the version quoted in refusal replies.
    pub version_max: u64,

    /// Whether block-fetch may serve compressed batches to peers whose
    /// negotiated version supports them.
    pub block_compression: bool,
}

impl Config {
    /// The protocol versions this node negotiates.
    pub fn version_range(&self) -> RangeInclusive<u64> {
        self.version_min..=self.version_max
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "127.0.0.1:3001".to_string(),
            version_min: *RECOGNIZED_VERSIONS.start(),
            version_max: *RECOGNIZED_VERSIONS.end(),
            block_compression: true,
        }
    }
}
