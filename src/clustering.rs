//! Latency neighbourhoods ("barrios").
//!
//! Peers are grouped by complete-linkage agglomerative clustering over the
//! pairwise ping matrix: a cluster is a maximal set whose *worst* internal
//! ping is still under the merge threshold. The matrix is assembled from
//! every neighbour's reported ping map plus our own, so it is asymmetric
//! and sparse; a pair with no measurement in either direction has no edge
//! and can never end up in the same cluster.

use std::collections::HashMap;

use crate::nara::Nara;

/// Merge threshold in milliseconds.
pub const MERGE_THRESHOLD_MS: f64 = 50.0;

/// Cluster names handed out by rank. More clusters than names wraps around.
const CLUSTER_NAMES: [&str; 11] = [
    "olive", "peach", "sand", "ocean", "basil", "papaya", "brunch", "sorbet",
    "margarita", "bohemian", "terracotta",
];

/// `distance[x][y]` is the most recent known ping from x to y, in ms.
pub type DistanceMap = HashMap<String, HashMap<String, f64>>;

pub fn cluster_name(rank: usize) -> &'static str {
    CLUSTER_NAMES[rank % CLUSTER_NAMES.len()]
}

/// One row per nara with a view: each neighbour contributes its reported
/// ping map, and the local nara contributes its own measurements.
pub fn build_distance_map(
    neighbourhood: &HashMap<String, Nara>,
    self_name: &str,
    local_pings: HashMap<String, f64>,
) -> DistanceMap {
    let mut distances: DistanceMap = HashMap::new();
    for nara in neighbourhood.values() {
        distances.insert(nara.name.clone(), nara.status.ping_map.clone());
    }
    distances.insert(self_name.to_string(), local_pings);
    distances
}

/// Distance between two peers: the worse of the two directed measurements
/// that exist, `None` when neither direction was ever measured.
fn pair_distance(distances: &DistanceMap, a: &str, b: &str) -> Option<f64> {
    let ab = distances.get(a).and_then(|row| row.get(b)).copied();
    let ba = distances.get(b).and_then(|row| row.get(a)).copied();
    match (ab, ba) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}

/// Complete linkage: the maximum pairwise distance across two clusters.
/// Any unmeasured cross pair makes the clusters unmergeable.
fn linkage(distances: &DistanceMap, a: &[String], b: &[String]) -> Option<f64> {
    let mut worst = 0.0f64;
    for x in a {
        for y in b {
            worst = worst.max(pair_distance(distances, x, y)?);
        }
    }
    Some(worst)
}

/// Agglomerative clustering of the distance map's participants at
/// `threshold`. Members and the merge order are kept sorted, so identical
/// distance maps always produce identical clusters.
pub fn cluster(distances: &DistanceMap, threshold: f64) -> Vec<Vec<String>> {
    let mut clusters: Vec<Vec<String>> = distances.keys().map(|name| vec![name.clone()]).collect();
    clusters.sort();

    loop {
        let mut best: Option<(f64, usize, usize)> = None;
        for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                if let Some(dist) = linkage(distances, &clusters[i], &clusters[j]) {
                    if dist <= threshold && best.map_or(true, |(b, _, _)| dist < b) {
                        best = Some((dist, i, j));
                    }
                }
            }
        }
        let Some((_, i, j)) = best else { break };
        let merged = clusters.remove(j);
        clusters[i].extend(merged);
        clusters[i].sort();
        clusters.sort();
    }

    clusters
}

/// Minimum positive start time across a cluster's members, 0 when no member
/// has a known start time.
pub fn oldest_start_time(cluster: &[String], start_time: impl Fn(&str) -> i64) -> i64 {
    cluster
        .iter()
        .map(|name| start_time(name))
        .filter(|&t| t > 0)
        .min()
        .unwrap_or(0)
}

/// Rank clusters for naming: biggest first, ties broken by the oldest known
/// start time ascending, with all-unknown clusters after those that have
/// one. A final tie on member names keeps the order total.
pub fn sorted_clusters(
    mut clusters: Vec<Vec<String>>,
    start_time: impl Fn(&str) -> i64,
) -> Vec<Vec<String>> {
    clusters.sort_by(|a, b| {
        let oldest_a = oldest_start_time(a, &start_time);
        let oldest_b = oldest_start_time(b, &start_time);
        b.len()
            .cmp(&a.len())
            .then_with(|| match (oldest_a == 0, oldest_b == 0) {
                (false, false) => oldest_a.cmp(&oldest_b),
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                (true, true) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.cmp(b))
    });
    clusters
}
