//! Core data model: a nara's identity, its self-reported status, and the
//! observations one nara keeps about its peers.
//!
//! Everything here travels over the wire as JSON with the field names fixed
//! below, so renaming a field is a protocol change.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current unix time in seconds. All protocol timestamps use this clock.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ─── Nara ────────────────────────────────────────────────────────────────────

/// A participant in the mesh: a stable name plus its last-known status.
///
/// The local node holds one `Nara` for itself and one per neighbour. Remote
/// entries are replaced wholesale on every inbound update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Nara {
    pub name: String,
    pub status: NaraStatus,
}

impl Nara {
    pub fn new(name: impl Into<String>) -> Self {
        Nara { name: name.into(), status: NaraStatus::default() }
    }

    pub fn with_status(name: impl Into<String>, status: NaraStatus) -> Self {
        Nara { name: name.into(), status }
    }

    /// Look up this nara's observation of `name`, defaulting to a zero-valued
    /// observation when it has none.
    pub fn observation_of(&self, name: &str) -> Observation {
        self.status.observations.get(name).cloned().unwrap_or_default()
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Self-reported state gossiped on every newspaper announcement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct NaraStatus {
    /// Health indicator in `[0, 100]`; derived from host load. Low chattiness
    /// slows the announcement cadence and eventually sheds inbound traffic.
    pub chattiness: i64,
    pub host_stats: HostStats,
    /// Name of the latency cluster this nara believes it belongs to.
    pub barrio: String,
    /// This nara's view of its peers. Only meaningful for the owner; for
    /// remote naras this is how we learn *their* beliefs about others.
    pub observations: HashMap<String, Observation>,
    /// Most recent known ping to each peer, in milliseconds.
    pub ping_map: HashMap<String, f64>,
}

impl NaraStatus {
    /// Sleep interval in seconds scaled inversely with chattiness: a fully
    /// chatty nara sleeps `min`, a silent one sleeps `max`.
    pub fn chattiness_rate(&self, min: u64, max: u64) -> u64 {
        let span = max.saturating_sub(min) as i64;
        let scaled = min as i64 + (100 - self.chattiness) * span / 100;
        scaled.clamp(min as i64, max as i64) as u64
    }
}

/// Host-level statistics sampled by the sensors task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct HostStats {
    /// Seconds since host boot.
    pub uptime: u64,
    /// 1-minute load average normalised by CPU count.
    pub load_avg: f64,
}

// ─── Observations ────────────────────────────────────────────────────────────

/// Presence state of a peer as believed locally.
///
/// `Unknown` is the never-seen state and serialises as the empty string so
/// that old payloads without the field decode to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnlineStatus {
    #[default]
    #[serde(rename = "")]
    Unknown,
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "MISSING")]
    Missing,
    #[serde(rename = "OFFLINE")]
    Offline,
}

impl OnlineStatus {
    /// True for a peer that was seen before and then went away; renewed
    /// activity from such a peer counts as a restart.
    pub fn is_gone(self) -> bool {
        matches!(self, OnlineStatus::Missing | OnlineStatus::Offline)
    }
}

/// What the local nara believes about one peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Observation {
    /// Unix seconds of the peer's first boot, as reconciled with neighbours.
    pub start_time: i64,
    /// Monotonic restart counter.
    pub restarts: i64,
    /// Unix seconds of the most recent restart.
    pub last_restart: i64,
    /// Unix seconds the peer was last heard from.
    pub last_seen: i64,
    pub online: OnlineStatus,
    /// Latency cluster the peer is assigned to; empty when unclustered.
    pub cluster_name: String,
}

// ─── Ping events ─────────────────────────────────────────────────────────────

/// One latency measurement between two naras, published by the ping measurer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct PingEvent {
    pub from: String,
    pub to: String,
    pub time_ms: f64,
}
