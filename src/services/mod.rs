//! Services - gate discovery and enforcement logic
//!
//! - `clustering` - DBSCAN discovery of candidate gates
//! - `binding_tracker` - (gate, category) binding state machine
//! - `health` - per-gate window activity and health score
//! - `merge_detector` - duplicate gate detection and merging
//! - `optimizer` - adaptive threshold tuning
//! - `decision_recorder` - decision explanations for every transition
//! - `state` / `cycle` / `engine` - per-event state, one recompute cycle, entry points
//! - `scheduler` - periodic and on-demand triggers

pub mod binding_tracker;
pub mod clustering;
pub mod cycle;
pub mod decision_recorder;
pub mod engine;
pub mod health;
pub mod merge_detector;
pub mod optimizer;
pub mod scheduler;
pub mod state;

pub use engine::{CycleOutcome, CycleReport, EngineError, EngineSettings, GateEngine, OptimizeOutcome};
pub use scheduler::{Scheduler, Trigger};
