//! Orchestrations built on the engine.

pub mod order_processing;
