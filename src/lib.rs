//! Autorun - a gatekeeper for programs on removable media
//!
//! This crate provides:
//! - Drive monitor turning volume enumeration into attach events
//! - Directive fingerprinting and a persistent per-device trust store
//! - Isolation profiles (environment redirection, Linux confinement)
//! - The orchestrator tying attach, approval and launch together

pub mod cli;
pub mod concurrency;
pub mod config;
pub mod device;
pub mod directive;
pub mod monitor;
pub mod orchestrator;
pub mod paths;
pub mod sandbox;
pub mod trust;

pub use config::Config;
pub use device::{DeviceIdentity, VolumeSerial};
pub use directive::Directive;
pub use orchestrator::{FlowOutcome, Orchestrator};
