//! Domain models - the gate/binding data model and geospatial primitives
//!
//! - `types` - identifiers and the immutable `CheckinEvent`
//! - `geo` - haversine distance, centroids, spatial variance, grid index
//! - `gate` - `Gate` and its lifecycle status
//! - `binding` - `GateBinding` per (gate, category)
//! - `thresholds` - per-event `AdaptiveThresholds`
//! - `merge` - `MergeSuggestion` between duplicate gates
//! - `decision` - `DecisionExplanation` audit records

pub mod binding;
pub mod decision;
pub mod gate;
pub mod geo;
pub mod merge;
pub mod thresholds;
pub mod types;

// Re-export commonly used types at module level
pub use binding::{BindingKey, BindingStatus, GateBinding};
pub use decision::{DecisionExplanation, DecisionKind, DecisionQuery, DecisionSubject};
pub use gate::{ArchiveReason, Gate, GateStatus};
pub use geo::GeoPoint;
pub use merge::{MergeStatus, MergeSuggestion};
pub use thresholds::{AdaptiveThresholds, VenueType};
pub use types::{Category, CheckinEvent, CheckinId, EventId, GateId, WristbandId};
