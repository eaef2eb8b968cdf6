use thiserror::Error;

/// Lifecycle failures the CLI maps to stable messages and exit codes.
#[derive(Debug, Error)]
pub enum CaskError {
    #[error("cask '{token}' is not installed")]
    NotInstalled { token: String },

    #[error("cask '{token}' is already installed")]
    AlreadyInstalled { token: String },

    #[error("cask '{token}' conflicts with installed cask '{conflicting}'")]
    ConflictDetected { token: String, conflicting: String },

    #[error("{} operations failed:\n{}", errors.len(), render_errors(errors))]
    MultipleErrors { errors: Vec<anyhow::Error> },

    /// A failed upgrade could not be undone; the transaction marker stays.
    #[error("rollback of cask '{token}' failed: {rollback:#}; the upgrade had failed with: {cause:#}")]
    RollbackFailed {
        token: String,
        cause: anyhow::Error,
        rollback: anyhow::Error,
    },
}

fn render_errors(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|error| format!("  - {error:#}"))
        .collect::<Vec<_>>()
        .join("\n")
}
