//! `LocalNara` — the one nara this process runs, and the store of everything
//! it believes about its peers.
//!
//! All of the mutable local state (own status, the observations map, the
//! local ping map) lives behind a single mutex. Readers get copies, writers
//! either replace an observation wholesale or mutate it in place under the
//! lock, so concurrent timers and broker handlers cannot interleave a
//! read-modify-write.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::nara::{HostStats, Nara, NaraStatus, Observation};

pub struct LocalNara {
    name: String,
    me: Mutex<Nara>,
    /// Chattiness override from configuration; bypasses load-derived
    /// chattiness when set to a value in `[0, 100]`.
    force_chattiness: Option<i64>,
}

impl LocalNara {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        LocalNara {
            me: Mutex::new(Nara::new(name.clone())),
            name,
            force_chattiness: None,
        }
    }

    pub fn with_forced_chattiness(name: impl Into<String>, chattiness: i64) -> Self {
        let mut local = LocalNara::new(name);
        local.force_chattiness = Some(chattiness);
        local
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn force_chattiness(&self) -> Option<i64> {
        self.force_chattiness
    }

    fn lock(&self) -> MutexGuard<'_, Nara> {
        self.me.lock().expect("local nara lock poisoned")
    }

    // ─── Snapshots ───────────────────────────────────────────────────────────

    /// Copy of the full local nara, as published on hey-there and chau.
    pub fn me(&self) -> Nara {
        self.lock().clone()
    }

    /// Copy of the local status, as published in the newspaper.
    pub fn status(&self) -> NaraStatus {
        self.lock().status.clone()
    }

    pub fn chattiness(&self) -> i64 {
        self.lock().status.chattiness
    }

    pub fn chattiness_rate(&self, min: u64, max: u64) -> u64 {
        self.lock().status.chattiness_rate(min, max)
    }

    pub fn barrio(&self) -> String {
        self.lock().status.barrio.clone()
    }

    pub(crate) fn set_barrio(&self, barrio: String) {
        self.lock().status.barrio = barrio;
    }

    // ─── Observations ────────────────────────────────────────────────────────

    /// The local belief about `name`; zero-valued when the peer was never
    /// referenced before.
    pub fn observation(&self, name: &str) -> Observation {
        self.lock().observation_of(name)
    }

    pub fn set_observation(&self, name: impl Into<String>, observation: Observation) {
        self.lock().status.observations.insert(name.into(), observation);
    }

    pub fn me_observation(&self) -> Observation {
        self.observation(&self.name)
    }

    pub fn set_me_observation(&self, observation: Observation) {
        self.set_observation(self.name.clone(), observation);
    }

    /// Mutate the observation for `name` in place, creating a zero-valued
    /// entry first if the peer is new. The closure runs under the state lock
    /// and sees the current value, so transitions based on it cannot clobber
    /// a concurrent update.
    pub(crate) fn update_observation(&self, name: &str, f: impl FnOnce(&mut Observation)) {
        let mut me = self.lock();
        f(me.status.observations.entry(name.to_string()).or_default());
    }

    /// Snapshot of all observations, for the maintenance scan.
    pub fn observations(&self) -> HashMap<String, Observation> {
        self.lock().status.observations.clone()
    }

    // ─── Ping map ────────────────────────────────────────────────────────────

    /// Latest outbound latency measurements, keyed by peer name.
    pub fn ping_map(&self) -> HashMap<String, f64> {
        self.lock().status.ping_map.clone()
    }

    pub fn record_ping(&self, to: impl Into<String>, time_ms: f64) {
        self.lock().status.ping_map.insert(to.into(), time_ms);
    }

    pub fn forget_ping(&self, name: &str) {
        self.lock().status.ping_map.remove(name);
    }

    // ─── Host stats ──────────────────────────────────────────────────────────

    pub fn set_host_stats(&self, stats: HostStats, chattiness: i64) {
        let mut me = self.lock();
        me.status.host_stats = stats;
        me.status.chattiness = chattiness;
    }

    #[cfg(test)]
    pub(crate) fn set_chattiness(&self, chattiness: i64) {
        self.lock().status.chattiness = chattiness;
    }
}
