#![forbid(unsafe_code)]

//! Persistent stdio workers.
//!
//! Long-running interactive processes (a `llama-cli` text generator, Python
//! vision models) are started once per resource, synchronised on a
//! readiness marker, and driven with sentinel-framed request/response
//! exchanges over their pipes.

pub mod cache;
pub mod config;
pub mod errors;
pub mod session;
pub mod workers;

pub use cache::{SessionHost, WorkerCache};
pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use session::registry::{RegistryConfig, SessionRegistry};
pub use session::{SpawnSpec, Termination};
pub use workers::WorkerProfile;
