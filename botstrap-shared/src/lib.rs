//! Types shared between the botstrap library and its binary.

pub mod errors;

pub use errors::{BotstrapError, BotstrapResult};
