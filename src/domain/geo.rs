//! Geospatial primitives: great-circle distance, centroids, spatial variance
//! and a flat grid index for neighbourhood queries at venue scale.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius (IUGG) in meters
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Meters per degree of latitude on the mean sphere
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GeoError {
    #[error("invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
}

/// A validated WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Result<Self, GeoError> {
        let point = Self { lat, lon };
        if point.is_valid() {
            Ok(point)
        } else {
            Err(GeoError::InvalidCoordinate { lat, lon })
        }
    }

    /// Point displaced by the given meters north and east (flat-earth approximation)
    pub fn offset_m(&self, north_m: f64, east_m: f64) -> GeoPoint {
        let lon_scale = self.lat.to_radians().cos().max(1e-6) * METERS_PER_DEGREE;
        GeoPoint { lat: self.lat + north_m / METERS_PER_DEGREE, lon: self.lon + east_m / lon_scale }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Haversine distance in meters between two validated points
///
/// The `a` term is clamped to [0, 1] so rounding on antipodal or identical
/// inputs can never produce NaN.
#[inline]
pub fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Checked haversine distance, rejecting NaN or out-of-range coordinates
pub fn distance(a: GeoPoint, b: GeoPoint) -> Result<f64, GeoError> {
    for p in [a, b] {
        if !p.is_valid() {
            return Err(GeoError::InvalidCoordinate { lat: p.lat, lon: p.lon });
        }
    }
    Ok(distance_m(a, b))
}

/// Arithmetic mean position (adequate for venue-scale point sets)
pub fn centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (lat_sum, lon_sum) =
        points.iter().fold((0.0, 0.0), |(la, lo), p| (la + p.lat, lo + p.lon));
    Some(GeoPoint { lat: lat_sum / n, lon: lon_sum / n })
}

/// Weighted mean of two positions
pub fn weighted_midpoint(a: GeoPoint, weight_a: f64, b: GeoPoint, weight_b: f64) -> GeoPoint {
    let total = weight_a + weight_b;
    if total <= 0.0 {
        return centroid(&[a, b]).unwrap_or(a);
    }
    GeoPoint {
        lat: (a.lat * weight_a + b.lat * weight_b) / total,
        lon: (a.lon * weight_a + b.lon * weight_b) / total,
    }
}

/// Mean squared distance (m²) of a point set from its centroid
///
/// Empty sets have zero variance.
pub fn spatial_variance(points: &[GeoPoint]) -> Result<f64, GeoError> {
    if let Some(bad) = points.iter().find(|p| !p.is_valid()) {
        return Err(GeoError::InvalidCoordinate { lat: bad.lat, lon: bad.lon });
    }
    let Some(center) = centroid(points) else {
        return Ok(0.0);
    };
    let sum: f64 = points.iter().map(|p| distance_m(*p, center).powi(2)).sum();
    Ok(sum / points.len() as f64)
}

/// Equirectangular projection around an origin, in meters
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: GeoPoint,
    lon_scale: f64,
}

impl LocalProjection {
    pub fn new(origin: GeoPoint) -> Self {
        let lon_scale = origin.lat.to_radians().cos().max(1e-6) * METERS_PER_DEGREE;
        Self { origin, lon_scale }
    }

    #[inline]
    pub fn project(&self, p: GeoPoint) -> (f64, f64) {
        ((p.lon - self.origin.lon) * self.lon_scale, (p.lat - self.origin.lat) * METERS_PER_DEGREE)
    }
}

/// Uniform grid bucketing point indices by projected cell
///
/// With a cell size equal to the query radius, every neighbour within the
/// radius lies in the 3x3 block of cells around the query point.
pub struct GridIndex {
    projection: LocalProjection,
    cell_m: f64,
    cells: FxHashMap<(i64, i64), Vec<usize>>,
}

impl GridIndex {
    pub fn new(origin: GeoPoint, cell_m: f64) -> Self {
        Self {
            projection: LocalProjection::new(origin),
            cell_m: cell_m.max(0.1),
            cells: FxHashMap::default(),
        }
    }

    /// Build an index over a slice, keyed by slice position
    pub fn from_points(points: &[GeoPoint], cell_m: f64) -> Option<Self> {
        let origin = *points.first()?;
        let mut grid = Self::new(origin, cell_m);
        for (idx, p) in points.iter().enumerate() {
            grid.insert(idx, *p);
        }
        Some(grid)
    }

    #[inline]
    fn cell_of(&self, p: GeoPoint) -> (i64, i64) {
        let (x, y) = self.projection.project(p);
        ((x / self.cell_m).floor() as i64, (y / self.cell_m).floor() as i64)
    }

    pub fn insert(&mut self, idx: usize, p: GeoPoint) {
        let cell = self.cell_of(p);
        self.cells.entry(cell).or_default().push(idx);
    }

    /// Candidate indices in the 3x3 cells around `p`, in ascending order
    pub fn candidates(&self, p: GeoPoint) -> Vec<usize> {
        let (cx, cy) = self.cell_of(p);
        let mut out = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(ids) = self.cells.get(&(cx + dx, cy + dy)) {
                    out.extend_from_slice(ids);
                }
            }
        }
        out.sort_unstable();
        out
    }
}
