//! # Fuelwatch Common Library
//!
//! Shared code for the fuelwatch services:
//! - Common error type
//! - Configuration loading and root folder resolution
//! - Database pool, schema, and row models

pub mod config;
pub mod db;
pub mod error;

pub use config::{FuelwatchConfig, InspectionPolicy};
pub use error::{Error, Result};
