//! Operational HTTP surface for fuelwatch-cm
//!
//! Start/stop/run-now control plus read-only entity views for the
//! presentation layer. All handlers are safe to call while the scheduler
//! loop is live.

pub mod control;
pub mod health;
pub mod views;

pub use control::control_routes;
pub use health::health_routes;
pub use views::view_routes;
