//! Network testing utility functions for Grevy.

use rand::Rng;

/// Returns a random port number from the ephemeral port range.
///
/// Does not check if the port is already in use. It's impossible to do this
/// check in a reliable, cross-platform way.
///
/// Use this function when both ends of a connection need to agree on a port
/// before the listener exists. The range is the intersection of the
/// IANA/Windows/macOS and Linux ephemeral ranges, excluding the low ports
/// that Hyper-V and sequential macOS/Windows allocations tend to occupy.
pub fn random_known_port() -> u16 {
    rand::thread_rng().gen_range(53500..60999)
}
