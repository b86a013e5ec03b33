//! Static topology routing
//!
//! The mesh has exactly one sink: the gateway, device 0. Routing is a pure
//! lookup against a table baked into the firmware image — no discovery, no
//! recomputation. An empty table means every sensor has a direct link to
//! the gateway.
//!
//! Uplink (toward the gateway) is the table itself. Downlink (the ACK
//! path back to a sensor) is the same table inverted: walk the
//! destination's uplink chain and take the hop just below us.

use crate::config::ConfigError;
use crate::message::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One uplink edge: `device` relays through `next_hop` toward the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyLink {
    pub device: DeviceId,
    pub next_hop: DeviceId,
}

/// Static next-hop-toward-gateway mapping.
///
/// Devices without an entry are assumed to reach the gateway directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topology {
    links: Vec<TopologyLink>,
}

impl Topology {
    /// Build a topology from `(device, next_hop)` pairs.
    pub fn from_pairs(pairs: &[(DeviceId, DeviceId)]) -> Self {
        Self {
            links: pairs
                .iter()
                .map(|&(device, next_hop)| TopologyLink { device, next_hop })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// The configured uplink hop for a device, if any.
    pub fn uplink(&self, device: DeviceId) -> Option<DeviceId> {
        self.links
            .iter()
            .find(|link| link.device == device)
            .map(|link| link.next_hop)
    }

    /// Uplink path from `device` to the gateway, inclusive on both ends.
    ///
    /// Walks at most the size of the identity space; a table that loops is
    /// rejected by [`Topology::validate`] before anything routes.
    pub fn route_to_gateway(&self, device: DeviceId) -> Vec<DeviceId> {
        let mut path = vec![device];
        let mut current = device;
        while !current.is_gateway() && path.len() <= u8::MAX as usize {
            current = self.uplink(current).unwrap_or(DeviceId::GATEWAY);
            path.push(current);
        }
        path
    }

    /// Check every entry reaches the gateway within the identity space.
    pub fn validate(&self, number_of_devices: u8) -> Result<(), ConfigError> {
        for link in &self.links {
            if link.device == link.next_hop {
                return Err(ConfigError::SelfLoop(link.device.as_u8()));
            }
            if link.device.as_u8() >= number_of_devices
                || link.next_hop.as_u8() >= number_of_devices
            {
                return Err(ConfigError::UnreachableDevice(link.device.as_u8()));
            }
        }
        for link in &self.links {
            let mut current = link.device;
            let mut steps = 0u8;
            while !current.is_gateway() {
                if steps >= number_of_devices {
                    return Err(ConfigError::UnreachableDevice(link.device.as_u8()));
                }
                current = self.uplink(current).unwrap_or(DeviceId::GATEWAY);
                steps += 1;
            }
        }
        Ok(())
    }
}

/// Next-hop resolver for one node.
#[derive(Debug, Clone)]
pub struct Router {
    device_id: DeviceId,
    topology: Topology,
}

impl Router {
    pub fn new(device_id: DeviceId, topology: Topology) -> Self {
        Self {
            device_id,
            topology,
        }
    }

    /// The next receiver for a frame ultimately destined to `destination`.
    ///
    /// Toward the gateway this is the table lookup with a direct-link
    /// fallback. Away from the gateway it is the reverse of the
    /// destination's uplink chain; if this node is not on that chain the
    /// destination is assumed directly reachable.
    pub fn next_hop(&self, destination: DeviceId) -> DeviceId {
        if destination.is_broadcast() || destination == self.device_id {
            return destination;
        }
        if destination.is_gateway() {
            return self.topology.uplink(self.device_id).unwrap_or(DeviceId::GATEWAY);
        }
        let chain = self.topology.route_to_gateway(destination);
        match chain.iter().position(|&hop| hop == self.device_id) {
            Some(idx) if idx > 0 => chain[idx - 1],
            _ => destination,
        }
    }
}

/// Duplicate-frame suppression keyed by (sender, sequence).
///
/// Entries expire after `window_ms` on the caller's clock; the cache is
/// bounded and sheds expired entries before growing past `max_size`.
#[derive(Debug)]
pub struct SeenCache {
    seen: HashMap<(DeviceId, u16), u64>,
    window_ms: u64,
    max_size: usize,
}

impl SeenCache {
    pub fn new(window_ms: u64, max_size: usize) -> Self {
        Self {
            seen: HashMap::new(),
            window_ms,
            max_size,
        }
    }

    /// Record a sighting. Returns true if the key is NEW within the window.
    pub fn check_and_add(&mut self, key: (DeviceId, u16), now_ms: u64) -> bool {
        if let Some(&seen_at) = self.seen.get(&key) {
            if now_ms.saturating_sub(seen_at) < self.window_ms {
                return false;
            }
        }
        if self.seen.len() >= self.max_size {
            self.cleanup(now_ms);
        }
        self.seen.insert(key, now_ms);
        true
    }

    /// Drop entries older than the window.
    pub fn cleanup(&mut self, now_ms: u64) {
        let window = self.window_ms;
        self.seen
            .retain(|_, &mut seen_at| now_ms.saturating_sub(seen_at) < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_topology() -> Topology {
        // 3 -> 2 -> 1 -> gateway
        Topology::from_pairs(&[
            (DeviceId(3), DeviceId(2)),
            (DeviceId(2), DeviceId(1)),
        ])
    }

    #[test]
    fn test_empty_topology_is_direct() {
        let router = Router::new(DeviceId(5), Topology::default());
        assert_eq!(router.next_hop(DeviceId::GATEWAY), DeviceId::GATEWAY);
    }

    #[test]
    fn test_uplink_lookup() {
        let router = Router::new(DeviceId(3), chain_topology());
        assert_eq!(router.next_hop(DeviceId::GATEWAY), DeviceId(2));

        let router = Router::new(DeviceId(2), chain_topology());
        assert_eq!(router.next_hop(DeviceId::GATEWAY), DeviceId(1));

        let router = Router::new(DeviceId(1), chain_topology());
        assert_eq!(router.next_hop(DeviceId::GATEWAY), DeviceId::GATEWAY);
    }

    #[test]
    fn test_downlink_inverts_uplink() {
        // ACK path from the gateway back to device 3 retraces the chain.
        let router = Router::new(DeviceId::GATEWAY, chain_topology());
        assert_eq!(router.next_hop(DeviceId(3)), DeviceId(1));

        let router = Router::new(DeviceId(1), chain_topology());
        assert_eq!(router.next_hop(DeviceId(3)), DeviceId(2));

        let router = Router::new(DeviceId(2), chain_topology());
        assert_eq!(router.next_hop(DeviceId(3)), DeviceId(3));
    }

    #[test]
    fn test_off_path_falls_back_direct() {
        let router = Router::new(DeviceId(7), chain_topology());
        assert_eq!(router.next_hop(DeviceId(5)), DeviceId(5));
    }

    #[test]
    fn test_route_to_gateway() {
        let path = chain_topology().route_to_gateway(DeviceId(3));
        assert_eq!(
            path,
            vec![DeviceId(3), DeviceId(2), DeviceId(1), DeviceId::GATEWAY]
        );
    }

    #[test]
    fn test_validate_detects_cycle() {
        let looped = Topology::from_pairs(&[
            (DeviceId(3), DeviceId(2)),
            (DeviceId(2), DeviceId(3)),
        ]);
        assert!(matches!(
            looped.validate(20),
            Err(ConfigError::UnreachableDevice(_))
        ));
    }

    #[test]
    fn test_validate_detects_self_loop() {
        let looped = Topology::from_pairs(&[(DeviceId(4), DeviceId(4))]);
        assert_eq!(looped.validate(20), Err(ConfigError::SelfLoop(4)));
    }

    #[test]
    fn test_validate_detects_out_of_range() {
        let bad = Topology::from_pairs(&[(DeviceId(25), DeviceId(1))]);
        assert!(matches!(
            bad.validate(20),
            Err(ConfigError::UnreachableDevice(25))
        ));
    }

    #[test]
    fn test_seen_cache_window() {
        let mut cache = SeenCache::new(500, 64);
        let key = (DeviceId(5), 12);

        assert!(cache.check_and_add(key, 1_000));
        assert!(!cache.check_and_add(key, 1_200));
        // Window elapsed, the key counts as new again.
        assert!(cache.check_and_add(key, 1_600));
    }

    #[test]
    fn test_seen_cache_bounded() {
        let mut cache = SeenCache::new(100, 4);
        for seq in 0..4 {
            assert!(cache.check_and_add((DeviceId(1), seq), 0));
        }
        // All four are expired by now; capacity pressure sheds them.
        assert!(cache.check_and_add((DeviceId(1), 99), 1_000));
        assert!(cache.len() <= 4);
    }
}
