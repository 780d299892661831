// conductor-common: shared constants, naming helpers, and logging setup for
// the Conductor multi-stage test orchestrator.

pub mod constants;
pub mod logging;
pub mod naming;

pub use naming::{job_name_hash, per_test_object_name, sanitize_job_name, volume_name};
