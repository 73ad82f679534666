//! Run lifecycle events
//!
//! In-process broadcast of job, workspace and checkpoint events so that
//! observers (progress display, logs) can follow a run without touching
//! orchestrator state.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
