//! Process wiring: configuration, the module registry, the checker and the
//! health endpoint.

pub mod app;
pub mod checker;
pub mod config;
pub mod health;

pub use app::{parse_modules, App, Components, EmailBackend, Module};
pub use checker::{CheckError, CheckFailure, CheckReport, Checker, CheckerConfig};
pub use config::{parse_duration, Config};
