//! Cadence operator - configuration, CRD installation and controller wiring

pub mod config;
pub mod controller_runner;
pub mod startup;
