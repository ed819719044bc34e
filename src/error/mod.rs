//! Per-subsystem error types.
//!
//! Each module defines its own error enum with a manual `Display` impl and
//! targeted `From` conversions from the library errors it wraps, mirroring
//! how the rest of this codebase handles errors: no `thiserror`/`anyhow`,
//! just plain enums that know how to render themselves for the log.

pub mod config;
pub mod dns;
pub mod relay;
