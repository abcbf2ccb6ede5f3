//! Common utilities and types shared across Carelink hub components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (validation, claims, constants)
pub mod jwt;
