//! Density-based discovery of candidate gates from windowed check-ins
//!
//! Runs DBSCAN over the usable locations of a check-in window:
//! - Points are processed in check-in id order so the result never depends
//!   on how the feed happened to order the snapshot
//! - Neighbourhoods come from a grid index with cell size = epsilon, then a
//!   haversine test against epsilon
//! - Unlocated check-ins carrying WiFi/BLE signals join the cluster whose
//!   located members share the most signals with them

use crate::domain::geo::{self, GeoPoint, GridIndex};
use crate::domain::types::{Category, CheckinEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Weight of spatial tightness in discovery confidence
const TIGHTNESS_WEIGHT: f64 = 0.4;
/// Weight of cluster size relative to min_samples
const SIZE_WEIGHT: f64 = 0.3;
/// Weight of dominant-category purity
const PURITY_WEIGHT: f64 = 0.3;
/// A cluster of this many times min_samples earns the full size score
const FULL_SIZE_MULTIPLE: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    pub eps_m: f64,
    pub min_samples: usize,
    pub max_accuracy_m: f64,
}

/// One candidate gate
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Input indices of located members, ascending by check-in id
    pub members: Vec<usize>,
    /// Input indices of unlocated members corroborated by ambient signals
    pub ambient_members: Vec<usize>,
    pub centroid: GeoPoint,
    /// m²
    pub spatial_variance: f64,
    pub dominant_category: Category,
    /// Share of all members in the dominant category
    pub purity: f64,
    pub confidence: f64,
}

impl Cluster {
    #[inline]
    pub fn sample_count(&self) -> usize {
        self.members.len() + self.ambient_members.len()
    }
}

/// Result of one clustering pass
#[derive(Debug, Clone, Default)]
pub struct Clustering {
    pub clusters: Vec<Cluster>,
    /// Cluster index per input index; None for noise and unlocated scans
    /// without corroborating signals
    pub assignment: Vec<Option<usize>>,
}

impl Clustering {
    #[inline]
    pub fn cluster_of(&self, idx: usize) -> Option<usize> {
        self.assignment.get(idx).copied().flatten()
    }
}

/// Discovery confidence from tightness, size and purity, in [0, 1]
pub fn discovery_confidence(spatial_variance: f64, samples: usize, purity: f64, params: &ClusterParams) -> f64 {
    let eps_sq = params.eps_m * params.eps_m;
    let tightness = 1.0 / (1.0 + spatial_variance.max(0.0) / eps_sq);
    let size = (samples as f64 / (FULL_SIZE_MULTIPLE * params.min_samples.max(1) as f64)).min(1.0);
    let confidence = TIGHTNESS_WEIGHT * tightness + SIZE_WEIGHT * size + PURITY_WEIGHT * purity;
    confidence.clamp(0.0, 1.0)
}

/// Cluster a check-in window
pub fn discover(checkins: &[CheckinEvent], params: &ClusterParams) -> Clustering {
    let mut assignment = vec![None; checkins.len()];

    // Usable points sorted by check-in id
    let mut located: Vec<(usize, GeoPoint)> = checkins
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.usable_point(params.max_accuracy_m).map(|p| (i, p)))
        .collect();
    located.sort_by(|a, b| checkins[a.0].id.cmp(&checkins[b.0].id).then(a.0.cmp(&b.0)));

    let points: Vec<GeoPoint> = located.iter().map(|(_, p)| *p).collect();
    let Some(grid) = GridIndex::from_points(&points, params.eps_m) else {
        return Clustering { clusters: Vec::new(), assignment };
    };

    let neighbours = |i: usize| -> Vec<usize> {
        grid.candidates(points[i])
            .into_iter()
            .filter(|&j| geo::distance_m(points[i], points[j]) <= params.eps_m)
            .collect()
    };

    // Label per sorted position
    let mut labels: Vec<Option<usize>> = vec![None; points.len()];
    let mut visited = vec![false; points.len()];
    let mut cluster_count = 0usize;

    for start in 0..points.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let seed = neighbours(start);
        if seed.len() < params.min_samples {
            continue;
        }

        let cluster = cluster_count;
        cluster_count += 1;
        labels[start] = Some(cluster);

        let mut queue: VecDeque<usize> = seed.into_iter().collect();
        while let Some(j) = queue.pop_front() {
            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            let reach = neighbours(j);
            if reach.len() >= params.min_samples {
                queue.extend(reach.into_iter().filter(|&k| !visited[k] || labels[k].is_none()));
            }
        }
    }

    let mut located_members: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
    for (pos, label) in labels.iter().enumerate() {
        if let Some(c) = label {
            let input_idx = located[pos].0;
            located_members[*c].push(input_idx);
            assignment[input_idx] = Some(*c);
        }
    }

    let ambient_members = assign_ambient(checkins, params, &located_members, &mut assignment);

    let clusters = located_members
        .into_iter()
        .zip(ambient_members)
        .filter_map(|(members, ambient)| build_cluster(checkins, params, members, ambient))
        .collect::<Vec<_>>();

    // Keep assignment aligned with the surviving cluster indices
    if clusters.len() != cluster_count {
        let mut remap: FxHashMap<usize, usize> = FxHashMap::default();
        for (new_idx, cluster) in clusters.iter().enumerate() {
            if let Some(first) = cluster.members.first() {
                if let Some(old) = assignment[*first] {
                    remap.insert(old, new_idx);
                }
            }
        }
        for slot in assignment.iter_mut() {
            *slot = slot.and_then(|old| remap.get(&old).copied());
        }
    }

    Clustering { clusters, assignment }
}

/// Attach unlocated check-ins to the cluster sharing the most signals
fn assign_ambient(
    checkins: &[CheckinEvent],
    params: &ClusterParams,
    located_members: &[Vec<usize>],
    assignment: &mut [Option<usize>],
) -> Vec<Vec<usize>> {
    let mut ambient: Vec<Vec<usize>> = vec![Vec::new(); located_members.len()];
    if located_members.is_empty() {
        return ambient;
    }

    let signatures: Vec<FxHashSet<String>> = located_members
        .iter()
        .map(|members| members.iter().flat_map(|&i| checkins[i].signals.keys()).collect())
        .collect();

    let mut unlocated: Vec<usize> = checkins
        .iter()
        .enumerate()
        .filter(|(_, c)| c.usable_point(params.max_accuracy_m).is_none() && !c.signals.is_empty())
        .map(|(i, _)| i)
        .collect();
    unlocated.sort_by(|a, b| checkins[*a].id.cmp(&checkins[*b].id));

    for idx in unlocated {
        let keys: Vec<String> = checkins[idx].signals.keys().collect();
        let mut best: Option<(usize, usize)> = None;
        for (cluster, signature) in signatures.iter().enumerate() {
            let shared = keys.iter().filter(|k| signature.contains(*k)).count();
            if shared == 0 {
                continue;
            }
            // Strictly greater keeps the lowest cluster index on ties
            if best.map_or(true, |(_, s)| shared > s) {
                best = Some((cluster, shared));
            }
        }
        if let Some((cluster, _)) = best {
            ambient[cluster].push(idx);
            assignment[idx] = Some(cluster);
        }
    }
    ambient
}

fn build_cluster(
    checkins: &[CheckinEvent],
    params: &ClusterParams,
    members: Vec<usize>,
    ambient_members: Vec<usize>,
) -> Option<Cluster> {
    let points: Vec<GeoPoint> = members
        .iter()
        .filter_map(|&i| checkins[i].usable_point(params.max_accuracy_m))
        .collect();
    let centroid = geo::centroid(&points)?;
    let spatial_variance = geo::spatial_variance(&points).ok()?;

    let mut counts: FxHashMap<&Category, usize> = FxHashMap::default();
    for &i in members.iter().chain(ambient_members.iter()) {
        *counts.entry(&checkins[i].category).or_insert(0) += 1;
    }
    // Highest count wins, lexicographically smallest category on ties
    let (dominant, dominant_count) = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(c, n)| ((*c).clone(), *n))?;

    let total = members.len() + ambient_members.len();
    let purity = dominant_count as f64 / total as f64;
    let confidence = discovery_confidence(spatial_variance, total, purity, params);

    Some(Cluster {
        members,
        ambient_members,
        centroid,
        spatial_variance,
        dominant_category: dominant,
        purity,
        confidence,
    })
}
