use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanningError {
    #[error("invalid planning input: {0}")]
    InvalidInput(String),
}
