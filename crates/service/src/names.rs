//! The shared peer map.
//!
//! Two maps mutated together under one mutex: `ip -> hostname` and
//! `hostname -> {ips}`. An IP holds at most one name at a time; a name may
//! be claimed by any number of IPs, because collisions are legal on this
//! protocol. The announce engine is the only writer. The control engine,
//! the SOCKS resolver and tests read through deep copies, so no caller ever
//! holds a reference into locked state.
//!
//! The mutex is a leaf: nothing acquires another lock while holding it.

use std::{collections::HashMap as StdHashMap, net::Ipv4Addr, sync::Arc};

use ahash::{HashMap, HashSet, HashSetExt};
use parking_lot::Mutex;

#[derive(Default)]
struct State {
    ip_to_host: HashMap<Ipv4Addr, String>,
    host_to_ips: HashMap<String, HashSet<Ipv4Addr>>,
}

/// A cheaply clonable handle on the peer map.
#[derive(Clone, Default)]
pub struct NameTable(Arc<Mutex<State>>);

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `ip` currently claims `hostname`, replacing whatever
    /// name the IP held before. A vacated reverse entry is pruned once its
    /// last IP leaves.
    pub fn assign(&self, ip: Ipv4Addr, hostname: &str) {
        let state = &mut *self.0.lock();

        if let Some(old) = state.ip_to_host.insert(ip, hostname.to_owned()) {
            if old != hostname {
                if let Some(ips) = state.host_to_ips.get_mut(&old) {
                    ips.remove(&ip);
                    if ips.is_empty() {
                        state.host_to_ips.remove(&old);
                    }
                }
            }
        }

        state
            .host_to_ips
            .entry(hostname.to_owned())
            .or_insert_with(HashSet::new)
            .insert(ip);
    }

    /// Forgets an IP entirely, on TTL eviction.
    pub fn remove(&self, ip: Ipv4Addr) {
        let state = &mut *self.0.lock();

        if let Some(hostname) = state.ip_to_host.remove(&ip) {
            if let Some(ips) = state.host_to_ips.get_mut(&hostname) {
                ips.remove(&ip);
                if ips.is_empty() {
                    state.host_to_ips.remove(&hostname);
                }
            }
        }
    }

    /// Every IP currently claiming a hostname; empty when nobody does.
    pub fn query_host(&self, hostname: &str) -> Vec<Ipv4Addr> {
        self.0
            .lock()
            .host_to_ips
            .get(hostname)
            .map(|ips| ips.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The hostname an IP last announced, if it is still alive.
    pub fn query_ip(&self, ip: Ipv4Addr) -> Option<String> {
        self.0.lock().ip_to_host.get(&ip).cloned()
    }

    /// A deep copy of the whole mapping, restricted to names with at least
    /// one IP.
    pub fn snapshot(&self) -> StdHashMap<String, Vec<Ipv4Addr>> {
        self.0
            .lock()
            .host_to_ips
            .iter()
            .filter(|(_, ips)| !ips.is_empty())
            .map(|(hostname, ips)| (hostname.clone(), ips.iter().copied().collect()))
            .collect()
    }
}
