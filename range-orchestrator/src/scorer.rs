//! Host scorer
//!
//! Reads a fresh utilization snapshot from every available host, drops the
//! hosts below the placement thresholds and picks the best weighted score.

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::compute::ComputeApi;
use crate::config::{FractionBasis, PlacementConfig, ResourceWeights};
use crate::models::{Host, ResourceSnapshot};

/// A host is eligible only if it meets every absolute and fractional threshold.
pub fn is_eligible(snapshot: &ResourceSnapshot, cfg: &PlacementConfig) -> bool {
    let (memory_basis, disk_basis) = match cfg.fraction_basis {
        FractionBasis::Free => (snapshot.free_memory, snapshot.free_disk),
        FractionBasis::Total => (snapshot.total_memory, snapshot.total_disk),
    };

    snapshot.cpu_reading() < cfg.max_cpu_busy
        && snapshot.free_memory >= cfg.min_required.memory_bytes
        && snapshot.free_memory as f64 >= memory_basis as f64 * cfg.min_free_fraction.memory
        && snapshot.free_disk >= cfg.min_required.disk_bytes
        && snapshot.free_disk as f64 >= disk_basis as f64 * cfg.min_free_fraction.disk
}

/// Weighted desirability. The CPU term is the raw reading, not inverted.
pub fn score(snapshot: &ResourceSnapshot, weights: &ResourceWeights) -> f64 {
    snapshot.cpu_reading() * weights.cpu
        + snapshot.free_memory as f64 * weights.memory
        + snapshot.free_disk as f64 * weights.disk
}

/// Pick the eligible host with the highest score; the earliest host wins ties.
///
/// Snapshots are fetched concurrently. A host whose probe fails is marked
/// unavailable for the rest of the run. `None` means no capacity.
pub async fn select_best_host(compute: &dyn ComputeApi, hosts: &mut [Host], cfg: &PlacementConfig) -> Option<Host> {
    let probes = hosts.iter().map(|host| async move {
        if host.available {
            Some(compute.node_status(&host.name).await)
        } else {
            None
        }
    });
    let snapshots = join_all(probes).await;

    let mut best: Option<(usize, f64)> = None;
    for (idx, probe) in snapshots.into_iter().enumerate() {
        let host = &mut hosts[idx];
        let snapshot = match probe {
            None => {
                debug!("Skipping unavailable host {}", host.name);
                continue;
            }
            Some(Err(e)) => {
                warn!("Status of host {} unavailable, excluding it from this run: {}", host.name, e);
                host.available = false;
                continue;
            }
            Some(Ok(snapshot)) => snapshot,
        };

        if !is_eligible(&snapshot, cfg) {
            debug!(
                "Host {} not eligible (cpu {:.1}, free mem {}, free disk {})",
                host.name,
                snapshot.cpu_reading(),
                snapshot.free_memory,
                snapshot.free_disk
            );
            continue;
        }

        let host_score = score(&snapshot, &cfg.weights);
        debug!("Host {} scored {:.1}", host.name, host_score);
        if best.map_or(true, |(_, best_score)| host_score > best_score) {
            best = Some((idx, host_score));
        }
    }

    let (idx, best_score) = best?;
    info!("Selected host {} (score {:.1})", hosts[idx].name, best_score);
    Some(hosts[idx].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn snapshot(cpu: f64, free_mem_gib: u64, free_disk_gib: u64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_busy: cpu,
            free_memory: free_mem_gib * GIB,
            total_memory: 64 * GIB,
            free_disk: free_disk_gib * GIB,
            total_disk: 1000 * GIB,
        }
    }

    #[test]
    fn test_thresholds() {
        let cfg = PlacementConfig::default();
        assert!(is_eligible(&snapshot(0.2, 8, 100), &cfg));
        // busy CPU
        assert!(!is_eligible(&snapshot(0.9, 8, 100), &cfg));
        // 0.86 rounds to 0.9
        assert!(!is_eligible(&snapshot(0.86, 8, 100), &cfg));
        // below absolute memory / disk minimums
        assert!(!is_eligible(&snapshot(0.2, 1, 100), &cfg));
        assert!(!is_eligible(&snapshot(0.2, 8, 10), &cfg));
    }

    #[test]
    fn test_fraction_against_free_always_holds() {
        let cfg = PlacementConfig::default();
        // 3 GiB free of 64 is under 10% of total, but passes against itself
        assert!(is_eligible(&snapshot(0.2, 3, 100), &cfg));
    }

    #[test]
    fn test_fraction_against_total() {
        let cfg = PlacementConfig {
            fraction_basis: FractionBasis::Total,
            ..PlacementConfig::default()
        };
        assert!(!is_eligible(&snapshot(0.2, 3, 100), &cfg));
        assert!(is_eligible(&snapshot(0.2, 8, 100), &cfg));
        // 40 GiB of 1000 is under 5%
        assert!(!is_eligible(&snapshot(0.2, 8, 40), &cfg));
    }

    #[test]
    fn test_score_weights() {
        let weights = ResourceWeights { cpu: 2.0, memory: 1.0, disk: 0.5 };
        let s = ResourceSnapshot {
            cpu_busy: 0.5,
            free_memory: 100,
            total_memory: 0,
            free_disk: 10,
            total_disk: 0,
        };
        assert!((score(&s, &weights) - 106.0).abs() < 1e-9);
    }
}
