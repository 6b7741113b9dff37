//! CLI command implementations

pub mod config;
pub mod logs;
pub mod up;
pub mod version;

pub use logs::logs;
pub use up::up;
pub use version::version;
