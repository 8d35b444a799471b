//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: replays instances against their history and persists turns
//! - `worker`: executes activity tasks and reports completions

mod orchestration;
mod worker;
