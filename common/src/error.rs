use thiserror::Error;

/// Failure categories of a single invocation. Every one of them is terminal:
/// nothing is retried or rolled back, the operator re-invokes after fixing it.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("image build failed: {0}")]
    Build(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("smoke verification failed: {0}")]
    Verification(String),
}

impl OpError {
    /// Process exit code used by the CLI for this category.
    pub fn exit_code(&self) -> i32 {
        match self {
            OpError::Config(_) => 2,
            OpError::Build(_) => 3,
            OpError::Provision(_) => 4,
            OpError::Verification(_) => 5,
        }
    }
}
