//! Common types shared across the relay mesh signaling plane.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for typed `(method, data)` message catalogs
pub mod catalog;

/// Module for secret types that prevent accidental logging
pub mod secret;
