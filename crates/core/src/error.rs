use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid attempt status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Repair budget exhausted for job {0}: an attempt may repair only once")]
    RepairBudgetExhausted(String),

    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
