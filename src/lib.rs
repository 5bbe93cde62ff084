//! Single-phase energy metering agent with remotely controlled outputs.
//!
//! Every tick the agent pulls the desired state of three output lines from a
//! remote key-path store and drives the lines to match. Once per publish
//! interval it also samples voltage and current, integrates real power into
//! Wh/kWh registers and publishes a snapshot back to the store.

pub mod config;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod remote;
pub mod telemetry;
