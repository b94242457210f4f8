//! Definitions of constants.

use std::{ops::RangeInclusive, time::Duration};

/// The node-to-node protocol versions this crate can negotiate.
///
/// The handshake picks the largest version shared with the peer; proposals
/// with no overlap are refused with the full list.
pub const RECOGNIZED_VERSIONS: RangeInclusive<u64> = 14..=15;

/// The version quoted back to peers in refusal replies.
///
/// Refusals carry a version so that the peer can tell which negotiation rules
/// were applied; quoting the newest one we speak gives peers the best chance
/// of retrying compatibly.
pub const PROMOTED_VERSION: u64 = 15;

/// The lowest protocol version that supports compressed block batches.
///
/// Peers that negotiate an older version receive one `Block` message per
/// block instead.
pub const MIN_COMPRESSION_VERSION: u64 = 15;

/// The deadline applied to every bounded network step: connecting, writing a
/// segment, and reading a reply that is already due.
///
/// A timeout is treated as a transport failure and closes the connection.
/// Waiting for a peer's *next request* is not bounded by this deadline; an
/// idle but healthy peer keeps its connection.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the server sleeps after a failed accept before retrying.
///
/// Accept failures are almost always transient resource exhaustion; retrying
/// immediately would spin.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(500);
