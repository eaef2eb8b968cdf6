use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TAP: &str = "caskpack/core";

/// Lowercases and trims a user-supplied token without validating it.
pub fn normalize_token(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

pub fn is_valid_token(token: &str) -> bool {
    let mut chars = token.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return false;
    }
    chars.all(|ch| {
        ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '.' | '@' | '+')
    })
}

pub fn validate_token(token: &str) -> Result<()> {
    if !is_valid_token(token) {
        return Err(anyhow!("invalid cask token: '{token}'"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TapName {
    owner: String,
    repo: String,
}

impl TapName {
    pub fn new(owner: &str, repo: &str) -> Result<Self> {
        let owner = normalize_token(owner);
        let repo = normalize_token(repo);
        validate_tap_segment(&owner)?;
        validate_tap_segment(&repo)?;
        Ok(Self { owner, repo })
    }

    pub fn parse(input: &str) -> Result<Self> {
        let Some((owner, repo)) = input.trim().split_once('/') else {
            return Err(anyhow!("invalid tap name: '{input}'; expected owner/repo"));
        };
        if repo.contains('/') {
            return Err(anyhow!("invalid tap name: '{input}'; expected owner/repo"));
        }
        Self::new(owner, repo)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn default_remote(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for TapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

impl TryFrom<String> for TapName {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TapName> for String {
    fn from(value: TapName) -> Self {
        value.to_string()
    }
}

fn validate_tap_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment.len() > 64 {
        return Err(anyhow!("invalid tap segment: '{segment}'"));
    }
    let valid = segment
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '.'));
    if !valid || segment.starts_with('.') {
        return Err(anyhow!("invalid tap segment: '{segment}'"));
    }
    Ok(())
}

/// A token pinned to a tap, written `owner/repo/token`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedToken {
    pub tap: TapName,
    pub token: String,
}

impl QualifiedToken {
    pub fn new(tap: TapName, token: impl Into<String>) -> Self {
        Self {
            tap,
            token: token.into(),
        }
    }

    /// Parses `owner/repo/token`; returns `None` for any other shape.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = normalize_token(input);
        let mut parts = normalized.split('/');
        let (Some(owner), Some(repo), Some(token), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        if !is_valid_token(token) {
            return None;
        }
        let tap = TapName::new(owner, repo).ok()?;
        Some(Self::new(tap, token))
    }
}

impl fmt::Display for QualifiedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tap, self.token)
    }
}

/// Target of a tap migration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationTarget {
    /// `owner/repo/token`: another tap under a new token.
    TapAndToken(QualifiedToken),
    /// `owner/repo`: another tap, same token.
    Tap(TapName),
    /// `token`: same tap, new token.
    Token(String),
}

impl MigrationTarget {
    pub fn parse(input: &str) -> Result<Self> {
        let normalized = normalize_token(input);
        match normalized.matches('/').count() {
            0 => {
                validate_token(&normalized)?;
                Ok(Self::Token(normalized))
            }
            1 => Ok(Self::Tap(TapName::parse(&normalized)?)),
            2 => QualifiedToken::parse(&normalized)
                .map(Self::TapAndToken)
                .ok_or_else(|| anyhow!("invalid migration target: '{input}'")),
            _ => Err(anyhow!("invalid migration target: '{input}'")),
        }
    }

    /// Fully qualifies the target relative to the tap and token it migrates from.
    pub fn qualify(&self, from: &QualifiedToken) -> QualifiedToken {
        match self {
            Self::TapAndToken(qualified) => qualified.clone(),
            Self::Tap(tap) => QualifiedToken::new(tap.clone(), from.token.clone()),
            Self::Token(token) => QualifiedToken::new(from.tap.clone(), token.clone()),
        }
    }
}
