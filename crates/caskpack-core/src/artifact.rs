use std::path::{Component, Path};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArtifactDescriptor {
    /// Moved from the staged directory into the app directory.
    App {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Symlinked from the bin directory to the staged file.
    Binary {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Flat package handed to the OS installer.
    Pkg { path: String },
    /// Receipt ids forgotten on full uninstall.
    Uninstall {
        #[serde(default)]
        pkgutil: Vec<String>,
    },
}

impl ArtifactDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::App { .. } => "app",
            Self::Binary { .. } => "binary",
            Self::Pkg { .. } => "pkg",
            Self::Uninstall { .. } => "uninstall",
        }
    }

    /// File name the artifact occupies in its destination directory.
    pub fn target_name(&self) -> Option<String> {
        match self {
            Self::App { source, target } | Self::Binary { source, target } => Some(
                target
                    .clone()
                    .unwrap_or_else(|| file_name_of(source).to_string()),
            ),
            Self::Pkg { .. } | Self::Uninstall { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::App { source, target } | Self::Binary { source, target } => {
                validated_relative_path(source)?;
                if let Some(target) = target {
                    if target.is_empty() || target.contains('/') || target.contains('\\') {
                        return Err(anyhow!(
                            "{} target must be a plain file name: '{target}'",
                            self.kind()
                        ));
                    }
                }
                Ok(())
            }
            Self::Pkg { path } => validated_relative_path(path).map(|_| ()),
            Self::Uninstall { pkgutil } => {
                if pkgutil.iter().any(|id| id.trim().is_empty()) {
                    return Err(anyhow!("uninstall pkgutil ids must not be empty"));
                }
                Ok(())
            }
        }
    }
}

fn file_name_of(source: &str) -> &str {
    source.rsplit('/').next().unwrap_or(source)
}

pub fn validated_relative_path(path: &str) -> Result<&Path> {
    let rel = Path::new(path);
    if path.is_empty() || rel.is_absolute() {
        return Err(anyhow!("artifact path must be relative: '{path}'"));
    }
    if rel
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return Err(anyhow!("artifact path must not escape the staged directory: '{path}'"));
    }
    Ok(rel)
}
