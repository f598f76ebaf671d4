//! Crate containing common functions and types used in Tempest

#[macro_use]
extern crate tracing;

pub mod config;
pub mod data;
pub mod error;
pub mod event_queue;
pub mod memory;
pub mod metrics;
pub mod task;
pub mod time;
pub mod values;
