//! Thermal digital twin of a dwelling with a predictive heating controller.
//!
//! The [`sim::engine::Engine`] drives an RC [`sim::thermal::ThermalModel`]
//! through a weather and tariff [`scenario::Scenario`] on a
//! [`sim::clock::VirtualClock`], asking a [`sim::controller::Controller`]
//! for a heater command at every tick.

/// TOML configuration, presets, and engine assembly.
pub mod config;
pub mod error;
pub mod io;
pub mod scenario;
/// Simulation engine, thermal model, clock, and controllers.
pub mod sim;
pub mod tariff;
pub mod telemetry;
