//! I/O helpers: configuration files, child processes, and code regeneration.

pub mod config;
pub mod process;
pub mod prompt;
pub mod regenerator;
