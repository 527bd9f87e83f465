//! CBF sensor poller
//!
//! Connects to a correlator/beamformer control endpoint over KATCP, finds
//! its running arrays, and keeps two JSON snapshots per array up to date:
//! the per-host signal chain for the dashboard and the list of sensors that
//! are not nominal.

pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod katcp;
pub mod literal;
pub mod mapping;
pub mod normalize;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod supervisor;

pub use config::PollerConfig;
pub use error::{PollError, Result};
pub use health::HealthTracker;
pub use supervisor::{Supervisor, SupervisorState};
