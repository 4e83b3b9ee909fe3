//! Remote peer liveness tracking, per the data model's Host table: insert on
//! first HELO, refresh on every subsequent one, evict after
//! `HOST_EVICTION_INTERVALS` missed polls.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct HostEntry {
    pub ip: IpAddr,
    pub state: State,
    pub update_time: Instant,
}

#[derive(Default)]
pub struct HostTable {
    hosts: HashMap<IpAddr, HostEntry>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a brand-new peer as DOWN. Returns `true` if it did not already
    /// exist.
    pub fn insert_new(&mut self, ip: IpAddr, now: Instant) -> bool {
        if self.hosts.contains_key(&ip) {
            return false;
        }
        self.hosts.insert(ip, HostEntry { ip, state: State::Down, update_time: now });
        true
    }

    /// Mark an existing peer UP and refresh its timestamp. No-op if unknown.
    pub fn refresh(&mut self, ip: IpAddr, now: Instant) {
        if let Some(entry) = self.hosts.get_mut(&ip) {
            entry.state = State::Up;
            entry.update_time = now;
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.hosts.contains_key(ip)
    }

    pub fn get(&self, ip: &IpAddr) -> Option<&HostEntry> {
        self.hosts.get(ip)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Drop every entry not refreshed within `max_age`, logging each eviction.
    pub fn evict_stale(&mut self, now: Instant, max_age: std::time::Duration) {
        self.hosts.retain(|ip, entry| {
            let alive = now.duration_since(entry.update_time) <= max_age;
            if !alive {
                tracing::info!(%ip, "evicting stale peer");
            }
            alive
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn first_helo_inserts_down() {
        let mut table = HostTable::new();
        let now = Instant::now();
        assert!(table.insert_new(ip(1), now));
        assert!(!table.insert_new(ip(1), now));
        assert_eq!(table.get(&ip(1)).unwrap().state, State::Down);
    }

    #[test]
    fn subsequent_helo_refreshes_to_up() {
        let mut table = HostTable::new();
        let t0 = Instant::now();
        table.insert_new(ip(1), t0);
        table.refresh(ip(1), t0);
        assert_eq!(table.get(&ip(1)).unwrap().state, State::Up);
    }

    #[test]
    fn eviction_drops_entries_older_than_max_age() {
        let mut table = HostTable::new();
        let t0 = Instant::now();
        table.insert_new(ip(1), t0);
        table.insert_new(ip(2), t0);
        table.refresh(ip(2), t0 + Duration::from_secs(200));
        table.evict_stale(t0 + Duration::from_secs(200), Duration::from_secs(180));
        assert!(!table.contains(&ip(1)));
        assert!(table.contains(&ip(2)));
    }
}
