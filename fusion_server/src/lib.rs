mod config;
pub mod engine;
mod error;
pub mod observability;
pub mod risk;
pub mod rules;
pub mod store;
pub mod view;
pub mod window;

pub use config::*;
pub use engine::{FusionDriver, FusionEngine};
pub use error::FusionError;
pub use risk::{DeviceRiskSnapshot, RiskLevel, RiskScorer};
pub use rules::{incident_id, Incident, IncidentSeverity};
pub use store::FusionStore;
pub use view::TelemetryEventView;
