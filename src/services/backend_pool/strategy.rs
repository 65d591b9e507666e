//! Credential selection strategy
//!
//! Usable credentials are ranked by status (healthy before faulty). Within a
//! tier a shared round-robin cursor decides which one goes first, so load
//! spreads evenly across equally healthy keys instead of always hitting the
//! first configured one.

use super::credential::HealthStatus;

// ============================================================================
// Ranking
// ============================================================================

/// Tiers in selection order
const TIERS: [HealthStatus; 2] = [HealthStatus::Healthy, HealthStatus::Faulty];

/// Order in which credentials should be tried for one acquisition.
///
/// Each tier is rotated to start at `cursor % tier_len`; tiers are
/// concatenated best first. Unusable credentials are left out.
pub fn candidate_order(statuses: &[HealthStatus], cursor: usize) -> Vec<usize> {
    let mut order = Vec::with_capacity(statuses.len());
    for tier in TIERS {
        let members: Vec<usize> = statuses
            .iter()
            .enumerate()
            .filter(|(_, &status)| status == tier)
            .map(|(i, _)| i)
            .collect();
        if members.is_empty() {
            continue;
        }
        let start = cursor % members.len();
        order.extend_from_slice(&members[start..]);
        order.extend_from_slice(&members[..start]);
    }
    order
}

// ============================================================================
// Round-Robin Cursor
// ============================================================================

/// Rotation cursor over the whole credential list
#[derive(Debug, Default)]
pub struct RoundRobinCursor {
    position: usize,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Move to the next slot, wrapping at `total`
    pub fn advance(&mut self, total: usize) {
        self.position = if total == 0 {
            0
        } else {
            (self.position + 1) % total
        };
    }
}

// ============================================================================
// Tests
// ============================================================================
