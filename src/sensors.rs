//! Host statistics sampling.
//!
//! A background task refreshes uptime and the normalised 1-minute load
//! average every few seconds and derives self-chattiness from them: an idle
//! host is fully chatty, a host at or above one runit of load per CPU goes
//! silent. A configured override pins chattiness instead.

use std::sync::Arc;
use std::time::Duration;

use crate::local::LocalNara;
use crate::nara::HostStats;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Read uptime and the 1-minute load average, normalised by CPU count.
pub fn sample_host_stats() -> HostStats {
    let cpus = num_cpus::get().max(1) as f64;
    HostStats {
        uptime: sysinfo::System::uptime(),
        load_avg: sysinfo::System::load_average().one / cpus,
    }
}

/// Chattiness from normalised load: 100 at idle, 0 at full load.
pub fn derive_chattiness(load_avg: f64) -> i64 {
    if load_avg < 1.0 {
        ((1.0 - load_avg) * 100.0) as i64
    } else {
        0
    }
}

/// One sampling pass: store fresh stats and the chattiness they imply,
/// honouring a forced override in `[0, 100]`.
pub fn update_host_stats(local: &LocalNara) {
    let stats = sample_host_stats();
    let chattiness = match local.force_chattiness() {
        Some(forced) if (0..=100).contains(&forced) => forced,
        _ => derive_chattiness(stats.load_avg),
    };
    local.set_host_stats(stats, chattiness);
}

/// Periodic sampling loop; spawn alongside [`crate::network::Network::start`].
pub async fn run_host_stats(local: Arc<LocalNara>) {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    loop {
        ticker.tick().await;
        update_host_stats(&local);
    }
}
