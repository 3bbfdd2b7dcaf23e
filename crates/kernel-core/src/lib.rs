//! Conscience Kernel core primitives and shared types.

#![deny(unsafe_code)]

pub mod action;
pub mod codes;
pub mod config;
pub mod ids;
pub mod state;

/// Version of the kernel core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
