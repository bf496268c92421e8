#![doc = include_str!("../README.md")]

mod builder;
pub mod config;
pub mod health;
pub mod metrics;
pub mod telemetry;

#[cfg(test)]
mod tests;

pub use crate::builder::*;
