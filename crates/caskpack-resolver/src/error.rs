use std::error::Error as StdError;

use thiserror::Error;

use crate::loader::Loader;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cask '{reference}' is unavailable: {reason}")]
    Unavailable { reference: String, reason: String },

    #[error("cask '{token}' is unreadable")]
    Unreadable {
        token: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("cask '{expected}' is unreadable: declared token '{actual}' does not match")]
    TokenMismatch { expected: String, actual: String },

    #[error("cask '{token}' exists in multiple taps:\n{}", render_candidates(candidates))]
    Ambiguous { token: String, candidates: Vec<Loader> },
}

impl ResolveError {
    pub(crate) fn unavailable(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unreadable(token: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Unreadable {
            token: token.into(),
            source: source.into(),
        }
    }
}

fn render_candidates(candidates: &[Loader]) -> String {
    candidates
        .iter()
        .map(|candidate| format!("  {candidate}"))
        .collect::<Vec<_>>()
        .join("\n")
}
