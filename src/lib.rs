#![doc = include_str!("../README.md")]

#[macro_use]
extern crate tracing;

pub mod binformat;
pub mod cache_lookup;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod fs_util;
pub mod hash;
pub mod invocation_log;
pub mod manifest;
pub mod oracle;
pub mod plan;
pub mod reaper;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod tracer;

pub use config::BuildConfig;
pub use engine::{BuildReport, Engine};
pub use error::{Error, Result};
