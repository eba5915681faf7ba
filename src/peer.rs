//! In-memory table of known peers.
//!
//! Keyed by instance name, iterated in insertion order by the outbound
//! scanner. The table always contains the local node. Dead peers stay in
//! the table so late messages can still be deduplicated.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::config::Timings;
use crate::error::{Result, SyncError};
use crate::registry::ModuleDescriptor;

/// Rank of a peer whose `instanceInfo` we have not seen yet. Worst
/// possible, so it never wins an election.
pub const UNKNOWN_PRIORITY: i64 = i64::MAX;

#[derive(Debug, Clone)]
pub struct Peer {
    pub name: String,
    /// Transport endpoint, absent for a peer known only by name.
    pub address: Option<String>,
    /// Election rank, lower wins.
    pub priority: i64,
    /// When the most recent message from this peer arrived.
    pub last_seen: Option<Instant>,
    /// Largest envelope id seen from this peer.
    pub last_message_id: u64,
    /// Latched on liveness failure or a `lostPeer` announcement; cleared
    /// only by a fresh heartbeat or instanceInfo.
    pub known_dead: bool,
    /// Last module list this peer advertised.
    pub modules: Vec<ModuleDescriptor>,
}

impl Peer {
    pub fn named(name: impl Into<String>) -> Self {
        Peer {
            name: name.into(),
            address: None,
            priority: UNKNOWN_PRIORITY,
            last_seen: None,
            last_message_id: 0,
            known_dead: false,
            modules: Vec::new(),
        }
    }

    pub fn with_address(name: impl Into<String>, address: impl Into<String>) -> Self {
        let mut peer = Peer::named(name);
        peer.address = Some(address.into());
        peer
    }

    pub fn alive(&self, now: Instant, timings: &Timings) -> bool {
        if self.known_dead {
            return false;
        }
        match self.last_seen {
            Some(seen) => now.duration_since(seen) <= timings.dead_after(),
            None => false,
        }
    }

    /// Names of the modules this peer last claimed to be handling.
    pub fn handled_modules(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter(|d| d.handling)
            .map(|d| d.name.clone())
            .collect()
    }

    /// Whether the last advertisement claimed this exact module as handled.
    pub fn claims_handling(&self, module: &str) -> bool {
        self.modules.iter().any(|d| d.name == module && d.handling)
    }

    pub fn claims_available(&self, module: &str) -> bool {
        self.modules.iter().any(|d| d.name == module && d.available)
    }
}

pub struct PeerTable {
    entries: HashMap<String, Peer>,
    order: Vec<String>,
    self_name: String,
}

impl PeerTable {
    pub fn new(self_peer: Peer) -> Self {
        let self_name = self_peer.name.clone();
        let mut table = PeerTable {
            entries: HashMap::new(),
            order: Vec::new(),
            self_name,
        };
        table.insert(self_peer);
        table
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Peer> {
        self.entries.get_mut(name)
    }

    /// Insert or replace. New names go to the back of the scan order.
    pub fn insert(&mut self, peer: Peer) {
        if !self.entries.contains_key(&peer.name) {
            self.order.push(peer.name.clone());
        }
        self.entries.insert(peer.name.clone(), peer);
    }

    /// Fetch an entry, creating a name-only one if the peer is new.
    pub fn get_or_insert(&mut self, name: &str) -> &mut Peer {
        if !self.entries.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| Peer::named(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<Peer> {
        self.order.retain(|n| n != name);
        self.entries.remove(name)
    }

    /// Rekey an entry in place, keeping its scan-order slot.
    ///
    /// On collision the pre-existing entry wins and the table is left
    /// untouched; the caller closes the offending connection.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.entries.contains_key(new) {
            return Err(SyncError::RenameCollision(new.to_string()));
        }
        let mut peer = self
            .entries
            .remove(old)
            .ok_or_else(|| SyncError::UnknownPeer(old.to_string()))?;
        peer.name = new.to_string();
        for slot in &mut self.order {
            if slot == old {
                *slot = new.to_string();
            }
        }
        self.entries.insert(new.to_string(), peer);
        Ok(())
    }

    /// Snapshot of the scan order, taken at the start of an outbound pass
    /// so the pass survives concurrent table mutation.
    pub fn names_in_order(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.order.iter().filter_map(|name| self.entries.get(name))
    }

    /// Live remote peers, self excluded.
    pub fn live_remote(&self, now: Instant, timings: &Timings) -> Vec<&Peer> {
        self.iter()
            .filter(|p| p.name != self.self_name && p.alive(now, timings))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table() -> PeerTable {
        PeerTable::new(Peer::named("self"))
    }

    #[test]
    fn self_is_always_present() {
        let table = table();
        assert!(table.contains("self"));
        assert_eq!(table.names_in_order(), vec!["self"]);
    }

    #[test]
    fn insertion_order_is_stable() {
        let mut table = table();
        table.insert(Peer::with_address("b", "10.0.0.2:4000"));
        table.insert(Peer::with_address("a", "10.0.0.1:4000"));
        // Re-inserting an existing name does not move it.
        table.insert(Peer::with_address("b", "10.0.0.9:4000"));
        assert_eq!(table.names_in_order(), vec!["self", "b", "a"]);
        assert_eq!(
            table.get("b").unwrap().address.as_deref(),
            Some("10.0.0.9:4000")
        );
    }

    #[test]
    fn rename_keeps_slot_and_state() {
        let mut table = table();
        table.insert(Peer::with_address("10.0.0.5:4000", "10.0.0.5:4000"));
        table.insert(Peer::named("zed"));
        table.get_mut("10.0.0.5:4000").unwrap().last_message_id = 17;

        table.rename("10.0.0.5:4000", "bravo").unwrap();
        assert_eq!(table.names_in_order(), vec!["self", "bravo", "zed"]);
        assert!(!table.contains("10.0.0.5:4000"));
        let bravo = table.get("bravo").unwrap();
        assert_eq!(bravo.last_message_id, 17);
        assert_eq!(bravo.address.as_deref(), Some("10.0.0.5:4000"));
    }

    #[test]
    fn rename_collision_keeps_existing_entry() {
        let mut table = table();
        table.insert(Peer::with_address("placeholder", "10.0.0.5:4000"));
        table.insert(Peer::named("bravo"));

        let err = table.rename("placeholder", "bravo").unwrap_err();
        assert!(matches!(err, SyncError::RenameCollision(_)));
        assert!(table.contains("placeholder"));
        assert!(table.contains("bravo"));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_window_is_heartbeat_plus_grace() {
        let timings = Timings::default();
        let mut peer = Peer::named("b");
        assert!(!peer.alive(Instant::now(), &timings));

        peer.last_seen = Some(Instant::now());
        assert!(peer.alive(Instant::now(), &timings));

        tokio::time::advance(timings.dead_after()).await;
        assert!(peer.alive(Instant::now(), &timings));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!peer.alive(Instant::now(), &timings));
    }

    #[test]
    fn known_dead_overrides_recency() {
        let timings = Timings::default();
        let mut peer = Peer::named("b");
        peer.last_seen = Some(Instant::now());
        peer.known_dead = true;
        assert!(!peer.alive(Instant::now(), &timings));
    }

    #[test]
    fn module_claims_match_name_and_flag() {
        let mut peer = Peer::named("b");
        peer.modules = vec![
            ModuleDescriptor {
                name: "metrics".into(),
                available: true,
                handling: true,
            },
            ModuleDescriptor {
                name: "greeter".into(),
                available: true,
                handling: false,
            },
        ];
        assert!(peer.claims_handling("metrics"));
        assert!(!peer.claims_handling("greeter"));
        assert!(peer.claims_available("greeter"));
        assert_eq!(peer.handled_modules(), vec!["metrics"]);
    }
}
