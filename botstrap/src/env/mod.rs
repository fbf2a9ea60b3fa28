//! Runtime configuration: the environment snapshot and the launch spec.

mod launch_spec;
mod snapshot;

pub use launch_spec::{LAUNCH_SPEC_VERSION, LaunchSpec};
pub use snapshot::{
    EnvironmentRequest, EnvironmentSnapshot, looks_like_bot_token, materialize,
    validate_env_name, validate_timezone,
};
