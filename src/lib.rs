pub mod api;
pub mod cache;
pub mod chat;
pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod jobs;
pub mod metrics;
pub mod photo_context;
pub mod pipeline;
pub mod resource_manager;
pub mod retry;
pub mod state_manager;
pub mod vision;
pub mod wiki;

// Re-export commonly used types for easier testing
pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use crate::config::{Config, GeoConfig, GeoStrategy, JobConfig, LocateMode};
pub use crate::error::{LocateError, Result};
pub use crate::geo::{GeoContext, GeoContextBuilder, GeoPoint, Poi, ReverseGeoResult};
pub use crate::jobs::{JobScheduler, JobStatus, JobStore, JobView};
pub use crate::state_manager::{AppState, Collaborators};
pub use crate::vision::{Candidate, Identification, ImageInput, VisionEngine, VisionModel};
