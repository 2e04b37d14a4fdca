//! Model-family worker profiles.
//!
//! These wrappers only decide the command line, the readiness marker, the
//! response sentinel, and the termination signal of a worker; everything
//! else goes through the session registry and worker cache.

pub mod llama;
pub mod profile;
pub mod vision;

pub use profile::{decode_reply, WorkerProfile};
