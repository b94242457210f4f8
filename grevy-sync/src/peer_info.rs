//! Finding the deepest block shared with a peer.
//!
//! The search narrows in rounds of at most [`POINTS_PER_QUERY`] probes:
//! first across chunk starts, then across the blocks of one chunk. Probe
//! lists are sent newest-first, and the peer answers with the first point it
//! knows, so the newest match always wins.

use tracing::debug;

use grevy_chain::{ChunkRegistry, Point2, Point3};
use grevy_network::ChainClient;

use crate::SyncError;

/// The largest number of points sent in one intersection probe.
///
/// Chosen so a probe list fits comfortably into a single segment.
pub const POINTS_PER_QUERY: usize = 24;

/// A connected peer together with what we know about its chain.
pub struct PeerInfo {
    pub(crate) client: Box<dyn ChainClient>,
    pub(crate) tip: Point3,
    pub(crate) intersection: Option<Point2>,
}

impl PeerInfo {
    /// The peer's tip at the time of the search.
    pub fn tip(&self) -> Point3 {
        self.tip
    }

    /// The deepest block shared with the local chain, if any.
    pub fn intersection(&self) -> Option<Point2> {
        self.intersection
    }

    /// The peer's client, for follow-up operations.
    pub fn client_mut(&mut self) -> &mut dyn ChainClient {
        self.client.as_mut()
    }
}

fn chunk_start(
    registry: &dyn ChunkRegistry,
    index: usize,
) -> Result<(Point2, usize, usize), SyncError> {
    let summary = registry
        .chunk_summary(index)
        .ok_or_else(|| SyncError::Internal(format!("chunk {index} disappeared mid-search")))?;
    Ok((
        Point2 {
            slot: summary.first_slot,
            hash: summary.first_block_hash,
        },
        summary.first_block_pos,
        summary.num_blocks,
    ))
}

fn block_point(registry: &dyn ChunkRegistry, pos: usize) -> Result<Point2, SyncError> {
    registry
        .block_info(pos)
        .map(|info| info.point)
        .ok_or_else(|| SyncError::Internal(format!("block {pos} disappeared mid-search")))
}

/// One bisection round: probes the given indices (newest first) and returns
/// the peer's answer alongside the index-aligned probe list.
async fn probe_round<F>(
    client: &mut dyn ChainClient,
    indices: &[usize],
    mut point_at: F,
) -> Result<(Vec<Point2>, grevy_chain::IntersectionInfo), SyncError>
where
    F: FnMut(usize) -> Result<Point2, SyncError>,
{
    let mut probes = Vec::with_capacity(indices.len());
    for &index in indices {
        probes.push(point_at(index)?);
    }
    let mut points = probes.clone();
    points.reverse();
    let info = client.find_intersection(points).await?;
    Ok((probes, info))
}

/// Searches for the deepest block shared with the peer behind `client`.
///
/// An empty local chain, or a peer that knows none of our chunk starts,
/// yields a [`PeerInfo`] carrying the peer's tip and no intersection.
pub async fn find_peer(
    registry: &dyn ChunkRegistry,
    mut client: Box<dyn ChainClient>,
) -> Result<PeerInfo, SyncError> {
    if registry.num_chunks() == 0 {
        let info = client.find_tip().await?;
        return Ok(PeerInfo {
            client,
            tip: info.tip,
            intersection: None,
        });
    }

    // Phase A: narrow the intersection down to a single chunk by probing
    // evenly spaced chunk starts.
    let mut first = 0usize;
    let mut last = registry.num_chunks();
    while last - first > 1 {
        let dist = last - first;
        let step = dist.div_ceil(POINTS_PER_QUERY).max(1);
        let mut indices: Vec<usize> = (first..last).step_by(step).collect();
        // the window's newest chunk is always probed
        if indices.last() != Some(&(last - 1)) {
            if indices.len() >= POINTS_PER_QUERY {
                let tail = indices.len() - 1;
                indices[tail] = last - 1;
            } else {
                indices.push(last - 1);
            }
        }

        let (probes, info) = probe_round(client.as_mut(), &indices, |i| {
            chunk_start(registry, i).map(|(point, _, _)| point)
        })
        .await?;
        let Some(isect) = info.isect else {
            debug!("no shared chunk start, peer chain is unrelated or behind");
            return Ok(PeerInfo {
                client,
                tip: info.tip,
                intersection: None,
            });
        };
        let k = probes
            .iter()
            .position(|p| *p == isect)
            .ok_or_else(|| {
                SyncError::Internal("the peer answered with a point we did not probe".to_string())
            })?;
        first = indices[k];
        last = indices.get(k + 1).copied().unwrap_or(last);
    }

    // Phase B: bisect the blocks of the remaining chunk the same way.
    let (_, first_block_pos, num_blocks) = chunk_start(registry, first)?;
    let mut lo = first_block_pos;
    let mut hi = first_block_pos + num_blocks;
    while hi - lo > POINTS_PER_QUERY {
        let step = (hi - lo).div_ceil(POINTS_PER_QUERY).max(1);
        let positions: Vec<usize> = (lo..hi).step_by(step).collect();

        let (probes, info) =
            probe_round(client.as_mut(), &positions, |pos| block_point(registry, pos)).await?;
        // the chunk's first block matched in phase A, so something must match
        let Some(isect) = info.isect else {
            return Err(SyncError::IntersectionLost);
        };
        let k = probes
            .iter()
            .position(|p| *p == isect)
            .ok_or_else(|| {
                SyncError::Internal("the peer answered with a point we did not probe".to_string())
            })?;
        lo = positions[k];
        hi = positions.get(k + 1).copied().unwrap_or(hi);
    }

    // Final round: probe every remaining block; the newest match wins.
    let positions: Vec<usize> = (lo..hi).collect();
    let (_, info) =
        probe_round(client.as_mut(), &positions, |pos| block_point(registry, pos)).await?;
    match info.isect {
        Some(isect) => {
            debug!(slot = isect.slot, "intersection narrowed to a block");
            Ok(PeerInfo {
                client,
                tip: info.tip,
                intersection: Some(isect),
            })
        }
        None => Err(SyncError::IntersectionLost),
    }
}
