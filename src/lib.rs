#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod action;
pub mod config;
pub mod error;
pub mod local;
pub mod logging;
pub mod orchestrator;
pub mod provider;
pub mod telemetry;
