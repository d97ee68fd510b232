//! Per-event adaptive thresholds and their optimization audit trail
//!
//! Thresholds are a versioned value: each recompute cycle takes a copy at
//! cycle start, and only validated writes replace the stored record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Venue archetype used to seed thresholds at event setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueType {
    Stadium,
    Arena,
    Festival,
    Conference,
    Club,
    #[default]
    Generic,
}

impl VenueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueType::Stadium => "stadium",
            VenueType::Arena => "arena",
            VenueType::Festival => "festival",
            VenueType::Conference => "conference",
            VenueType::Club => "club",
            VenueType::Generic => "generic",
        }
    }
}

impl std::str::FromStr for VenueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "stadium" => VenueType::Stadium,
            "arena" => VenueType::Arena,
            "festival" => VenueType::Festival,
            "conference" => VenueType::Conference,
            "club" => VenueType::Club,
            "generic" => VenueType::Generic,
            other => return Err(format!("unknown venue type: {other}")),
        })
    }
}

/// Tunable parameter names, as recorded in the optimization history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdParameter {
    DuplicateDistanceMeters,
    PromotionSampleSize,
    ConfidenceThreshold,
    VelocityThreshold,
    MinClusterSamples,
}

impl ThresholdParameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdParameter::DuplicateDistanceMeters => "duplicate_distance_meters",
            ThresholdParameter::PromotionSampleSize => "promotion_sample_size",
            ThresholdParameter::ConfidenceThreshold => "confidence_threshold",
            ThresholdParameter::VelocityThreshold => "velocity_threshold",
            ThresholdParameter::MinClusterSamples => "min_cluster_samples",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdError {
    #[error("{parameter} must be {expected}, got {value}")]
    OutOfRange { parameter: &'static str, expected: &'static str, value: f64 },
}

fn out_of_range(parameter: ThresholdParameter, expected: &'static str, value: f64) -> ThresholdError {
    ThresholdError::OutOfRange { parameter: parameter.as_str(), expected, value }
}

/// One recorded parameter change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationEntry {
    pub parameter: ThresholdParameter,
    pub old_value: f64,
    pub new_value: f64,
    pub reason: String,
    /// Accuracy delta since the previous optimization run
    pub performance_improvement: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveThresholds {
    /// Clustering epsilon and merge proximity bound, in meters
    pub duplicate_distance_meters: f64,
    pub promotion_sample_size: u64,
    pub confidence_threshold: f64,
    /// Max plausible walking speed between scans of one wristband, m/s
    pub velocity_threshold: f64,
    pub min_cluster_samples: usize,
    pub last_optimization_at: Option<DateTime<Utc>>,
    /// Decision accuracy measured at the last optimization run
    pub last_measured_accuracy: Option<f64>,
    pub optimization_history: Vec<OptimizationEntry>,
    /// Bumped on every accepted write
    pub version: u64,
}

impl AdaptiveThresholds {
    /// Seed values for a venue type
    pub fn for_venue(venue: VenueType) -> Self {
        let (eps, promotion, confidence, velocity, min_samples) = match venue {
            VenueType::Stadium => (20.0, 50, 0.85, 8.0, 10),
            VenueType::Arena => (15.0, 40, 0.8, 6.0, 8),
            VenueType::Festival => (30.0, 50, 0.8, 8.0, 10),
            VenueType::Conference => (10.0, 20, 0.8, 4.0, 5),
            VenueType::Club => (8.0, 20, 0.75, 4.0, 5),
            VenueType::Generic => (20.0, 50, 0.8, 10.0, 10),
        };
        Self {
            duplicate_distance_meters: eps,
            promotion_sample_size: promotion,
            confidence_threshold: confidence,
            velocity_threshold: velocity,
            min_cluster_samples: min_samples,
            last_optimization_at: None,
            last_measured_accuracy: None,
            optimization_history: Vec::new(),
            version: 1,
        }
    }

    /// Check every tunable against its allowed range
    pub fn validate(&self) -> Result<(), ThresholdError> {
        let eps = self.duplicate_distance_meters;
        if !eps.is_finite() || eps <= 0.0 || eps > 1000.0 {
            return Err(out_of_range(
                ThresholdParameter::DuplicateDistanceMeters,
                "within (0, 1000] meters",
                eps,
            ));
        }
        if self.promotion_sample_size == 0 {
            return Err(out_of_range(ThresholdParameter::PromotionSampleSize, "at least 1", 0.0));
        }
        let conf = self.confidence_threshold;
        if !conf.is_finite() || conf <= 0.0 || conf > 1.0 {
            return Err(out_of_range(
                ThresholdParameter::ConfidenceThreshold,
                "within (0, 1]",
                conf,
            ));
        }
        let velocity = self.velocity_threshold;
        if !velocity.is_finite() || velocity <= 0.0 {
            return Err(out_of_range(
                ThresholdParameter::VelocityThreshold,
                "a positive finite speed",
                velocity,
            ));
        }
        if self.min_cluster_samples < 2 {
            return Err(out_of_range(
                ThresholdParameter::MinClusterSamples,
                "at least 2",
                self.min_cluster_samples as f64,
            ));
        }
        Ok(())
    }

    /// Current value of a parameter as f64
    pub fn value_of(&self, parameter: ThresholdParameter) -> f64 {
        match parameter {
            ThresholdParameter::DuplicateDistanceMeters => self.duplicate_distance_meters,
            ThresholdParameter::PromotionSampleSize => self.promotion_sample_size as f64,
            ThresholdParameter::ConfidenceThreshold => self.confidence_threshold,
            ThresholdParameter::VelocityThreshold => self.velocity_threshold,
            ThresholdParameter::MinClusterSamples => self.min_cluster_samples as f64,
        }
    }

    /// Set a parameter from f64, rounding integer parameters up
    pub fn set_value(&mut self, parameter: ThresholdParameter, value: f64) {
        match parameter {
            ThresholdParameter::DuplicateDistanceMeters => self.duplicate_distance_meters = value,
            ThresholdParameter::PromotionSampleSize => {
                self.promotion_sample_size = value.max(0.0).ceil() as u64
            }
            ThresholdParameter::ConfidenceThreshold => self.confidence_threshold = value,
            ThresholdParameter::VelocityThreshold => self.velocity_threshold = value,
            ThresholdParameter::MinClusterSamples => {
                self.min_cluster_samples = value.max(0.0).ceil() as usize
            }
        }
    }
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self::for_venue(VenueType::Generic)
    }
}

/// Optional per-event overrides of the venue seed values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverrides {
    #[serde(default)]
    pub duplicate_distance_meters: Option<f64>,
    #[serde(default)]
    pub promotion_sample_size: Option<u64>,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    #[serde(default)]
    pub velocity_threshold: Option<f64>,
    #[serde(default)]
    pub min_cluster_samples: Option<usize>,
}

impl ThresholdOverrides {
    /// Apply overrides on top of seed values, validating the result
    pub fn apply(&self, mut base: AdaptiveThresholds) -> Result<AdaptiveThresholds, ThresholdError> {
        if let Some(v) = self.duplicate_distance_meters {
            base.duplicate_distance_meters = v;
        }
        if let Some(v) = self.promotion_sample_size {
            base.promotion_sample_size = v;
        }
        if let Some(v) = self.confidence_threshold {
            base.confidence_threshold = v;
        }
        if let Some(v) = self.velocity_threshold {
            base.velocity_threshold = v;
        }
        if let Some(v) = self.min_cluster_samples {
            base.min_cluster_samples = v;
        }
        base.validate()?;
        Ok(base)
    }
}
