// src/config/mod.rs
pub mod scout;

pub use scout::{ControllerSection, ProvidersConfig, ScoutConfig};
