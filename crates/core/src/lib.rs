//! Data model shared by the isobatch crates: jobs, attempts, outcomes and
//! the durable checkpoint counter.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, Result};
