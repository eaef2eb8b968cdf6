use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactDescriptor;
use crate::token::{validate_token, TapName, DEFAULT_TAP};

pub const LATEST_VERSION: &str = "latest";
pub const NO_CHECK_SHA256: &str = "no_check";
/// Metadata leaf holding the definition file saved at install time.
pub const CASK_METADATA_LEAF: &str = "Casks";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDefinition {
    pub token: String,
    pub version: String,
    pub sha256: Option<String>,
    pub url: Option<String>,
    pub names: Vec<String>,
    pub desc: Option<String>,
    pub homepage: Option<String>,
    pub auto_updates: bool,
    pub depends_on: Vec<String>,
    pub conflicts_with: Vec<String>,
    pub artifacts: Vec<ArtifactDescriptor>,
    pub tap: Option<TapName>,
    pub source_path: Option<PathBuf>,
    pub source_text: Option<String>,
    pub loaded_from_api: bool,
}

impl PackageDefinition {
    pub fn is_latest(&self) -> bool {
        self.version == LATEST_VERSION
    }

    /// `token` for the default tap, `owner/repo/token` otherwise.
    pub fn full_token(&self) -> String {
        match &self.tap {
            Some(tap) if tap.to_string() != DEFAULT_TAP => format!("{tap}/{}", self.token),
            _ => self.token.clone(),
        }
    }

    /// `owner/repo/token` whenever the owning tap is known, whichever tap is
    /// configured as the default.
    pub fn qualified_token(&self) -> String {
        match &self.tap {
            Some(tap) => format!("{tap}/{}", self.token),
            None => self.token.clone(),
        }
    }

    pub fn with_tap(mut self, tap: Option<TapName>) -> Self {
        self.tap = tap;
        self
    }

    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn with_source_text(mut self, text: impl Into<String>) -> Self {
        self.source_text = Some(text.into());
        self
    }

    pub fn pkgutil_receipts(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter_map(|artifact| match artifact {
                ArtifactDescriptor::Uninstall { pkgutil } => Some(pkgutil.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Serialized form saved into the installed metadata: the original stanza
    /// source when there is one, otherwise a JSON record.
    pub fn caskfile(&self) -> Result<(&'static str, String)> {
        if let Some(text) = &self.source_text {
            return Ok(("cask", text.clone()));
        }
        let payload = serde_json::to_string_pretty(&CaskRecord::from(self))
            .with_context(|| format!("failed to serialize cask record for '{}'", self.token))?;
        Ok(("json", payload))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaskRelations {
    #[serde(default)]
    pub cask: Vec<String>,
}

/// Structured cask record as served by the JSON API and as saved for
/// definitions that have no stanza source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaskRecord {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<TapName>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub name: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default)]
    pub auto_updates: bool,
    #[serde(default)]
    pub depends_on: CaskRelations,
    #[serde(default)]
    pub conflicts_with: CaskRelations,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDescriptor>,
}

impl CaskRecord {
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).context("failed to parse cask JSON record")
    }

    /// Replays the record's fields through the same builder the stanza
    /// evaluator uses, so both paths enforce identical rules.
    pub fn replay(&self) -> Result<PackageDefinition> {
        let mut builder = DefinitionBuilder::new(&self.token)?;
        builder.version(&self.version)?;
        if let Some(sha256) = &self.sha256 {
            builder.sha256(sha256)?;
        }
        if let Some(url) = &self.url {
            builder.url(url)?;
        }
        for name in &self.name {
            builder.name(name);
        }
        if let Some(desc) = &self.desc {
            builder.desc(desc)?;
        }
        if let Some(homepage) = &self.homepage {
            builder.homepage(homepage)?;
        }
        builder.auto_updates(self.auto_updates);
        for dependency in &self.depends_on.cask {
            builder.depends_on_cask(dependency)?;
        }
        for conflict in &self.conflicts_with.cask {
            builder.conflicts_with_cask(conflict)?;
        }
        for artifact in &self.artifacts {
            builder.artifact(artifact.clone())?;
        }
        let mut definition = builder.build()?;
        definition.tap = self.tap.clone();
        definition.loaded_from_api = true;
        Ok(definition)
    }
}

impl From<&PackageDefinition> for CaskRecord {
    fn from(value: &PackageDefinition) -> Self {
        Self {
            token: value.token.clone(),
            tap: value.tap.clone(),
            version: value.version.clone(),
            sha256: Some(
                value
                    .sha256
                    .clone()
                    .unwrap_or_else(|| NO_CHECK_SHA256.to_string()),
            ),
            url: value.url.clone(),
            name: value.names.clone(),
            desc: value.desc.clone(),
            homepage: value.homepage.clone(),
            auto_updates: value.auto_updates,
            depends_on: CaskRelations {
                cask: value.depends_on.clone(),
            },
            conflicts_with: CaskRelations {
                cask: value.conflicts_with.clone(),
            },
            artifacts: value.artifacts.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DefinitionBuilder {
    token: String,
    version: Option<String>,
    sha256: Option<Option<String>>,
    url: Option<String>,
    names: Vec<String>,
    desc: Option<String>,
    homepage: Option<String>,
    auto_updates: bool,
    depends_on: Vec<String>,
    conflicts_with: Vec<String>,
    artifacts: Vec<ArtifactDescriptor>,
}

impl DefinitionBuilder {
    pub fn new(token: &str) -> Result<Self> {
        validate_token(token)?;
        Ok(Self {
            token: token.to_string(),
            version: None,
            sha256: None,
            url: None,
            names: Vec::new(),
            desc: None,
            homepage: None,
            auto_updates: false,
            depends_on: Vec::new(),
            conflicts_with: Vec::new(),
            artifacts: Vec::new(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn version(&mut self, version: &str) -> Result<&mut Self> {
        let version = version.trim();
        if version.is_empty() {
            return Err(anyhow!("version stanza must not be empty"));
        }
        if version.contains('/') || version.contains('\\') || version.starts_with('.') {
            return Err(anyhow!("invalid version: '{version}'"));
        }
        set_once(&mut self.version, version.to_string(), "version")?;
        Ok(self)
    }

    pub fn sha256(&mut self, sha256: &str) -> Result<&mut Self> {
        let sha256 = sha256.trim().to_ascii_lowercase();
        let value = if sha256 == NO_CHECK_SHA256 {
            None
        } else if sha256.len() == 64 && sha256.chars().all(|ch| ch.is_ascii_hexdigit()) {
            Some(sha256)
        } else {
            return Err(anyhow!("invalid sha256 checksum: '{sha256}'"));
        };
        set_once(&mut self.sha256, value, "sha256")?;
        Ok(self)
    }

    pub fn url(&mut self, url: &str) -> Result<&mut Self> {
        let url = url.trim();
        if !url.contains("://") {
            return Err(anyhow!("url must include a scheme: '{url}'"));
        }
        set_once(&mut self.url, url.to_string(), "url")?;
        Ok(self)
    }

    pub fn name(&mut self, name: &str) -> &mut Self {
        self.names.push(name.to_string());
        self
    }

    pub fn desc(&mut self, desc: &str) -> Result<&mut Self> {
        set_once(&mut self.desc, desc.to_string(), "desc")?;
        Ok(self)
    }

    pub fn homepage(&mut self, homepage: &str) -> Result<&mut Self> {
        set_once(&mut self.homepage, homepage.to_string(), "homepage")?;
        Ok(self)
    }

    pub fn auto_updates(&mut self, value: bool) -> &mut Self {
        self.auto_updates = value;
        self
    }

    pub fn depends_on_cask(&mut self, token: &str) -> Result<&mut Self> {
        validate_token(token)?;
        if !self.depends_on.iter().any(|existing| existing == token) {
            self.depends_on.push(token.to_string());
        }
        Ok(self)
    }

    pub fn conflicts_with_cask(&mut self, token: &str) -> Result<&mut Self> {
        validate_token(token)?;
        if !self.conflicts_with.iter().any(|existing| existing == token) {
            self.conflicts_with.push(token.to_string());
        }
        Ok(self)
    }

    pub fn artifact(&mut self, artifact: ArtifactDescriptor) -> Result<&mut Self> {
        artifact
            .validate()
            .with_context(|| format!("invalid {} artifact in '{}'", artifact.kind(), self.token))?;
        self.artifacts.push(artifact);
        Ok(self)
    }

    pub fn build(self) -> Result<PackageDefinition> {
        let version = self
            .version
            .ok_or_else(|| anyhow!("cask '{}' is missing a version stanza", self.token))?;
        if self.conflicts_with.contains(&self.token) {
            return Err(anyhow!("cask '{}' conflicts with itself", self.token));
        }
        if self.depends_on.contains(&self.token) {
            return Err(anyhow!("cask '{}' depends on itself", self.token));
        }

        Ok(PackageDefinition {
            token: self.token,
            version,
            sha256: self.sha256.flatten(),
            url: self.url,
            names: self.names,
            desc: self.desc,
            homepage: self.homepage,
            auto_updates: self.auto_updates,
            depends_on: self.depends_on,
            conflicts_with: self.conflicts_with,
            artifacts: self.artifacts,
            tap: None,
            source_path: None,
            source_text: None,
            loaded_from_api: false,
        })
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, stanza: &str) -> Result<()> {
    if slot.is_some() {
        return Err(anyhow!("'{stanza}' stanza may only appear once"));
    }
    *slot = Some(value);
    Ok(())
}
