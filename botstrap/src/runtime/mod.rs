//! Host-side runtime configuration: options, home directory layout and constants.

pub mod constants;
pub mod layout;
pub mod options;

pub use layout::FilesystemLayout;
pub use options::BotstrapOptions;
