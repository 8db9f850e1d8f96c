//! # Keel Server Library
//!
//! Wiring for the `keel-worker` process: store selection, the built-in
//! demonstration tasks and the run loop shared by the binary and its tests.

pub mod app;
pub mod startup;
pub mod tasks;
