use std::sync::Arc;

use anyhow::Result;
use caskpack_core::{normalize_token, Evaluator, PackageDefinition, StanzaEvaluator};
use caskpack_installer::Caskroom;
use caskpack_registry::TapCatalog;
use tracing::debug;

use crate::error::ResolveError;
use crate::loader::{Loader, Reference, LOADER_PRIORITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Log rename and migration notices.
    pub warn: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self { warn: true }
    }
}

impl ResolveOptions {
    pub fn quiet() -> Self {
        Self { warn: false }
    }
}

/// Turns references into definitions against one set of taps and one
/// Caskroom.
pub struct Resolver {
    catalog: TapCatalog,
    caskroom: Caskroom,
    evaluator: Arc<dyn Evaluator>,
}

impl Resolver {
    pub fn new(catalog: TapCatalog, caskroom: Caskroom) -> Self {
        Self {
            catalog,
            caskroom,
            evaluator: Arc::new(StanzaEvaluator),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn catalog(&self) -> &TapCatalog {
        &self.catalog
    }

    pub fn caskroom(&self) -> &Caskroom {
        &self.caskroom
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    /// The first loader in priority order that accepts `reference`.
    pub fn loader_for(
        &self,
        reference: &Reference,
        options: ResolveOptions,
    ) -> Result<Loader, ResolveError> {
        for kind in LOADER_PRIORITY {
            if let Some(loader) = kind.try_create(self, reference, options.warn)? {
                debug!(reference = %reference.describe(), loader = ?kind, "loader selected");
                return Ok(loader);
            }
        }
        Ok(Loader::Null {
            reference: reference.describe(),
        })
    }

    pub fn resolve(
        &self,
        reference: impl Into<Reference>,
        options: ResolveOptions,
    ) -> Result<PackageDefinition, ResolveError> {
        let reference = reference.into();
        self.loader_for(&reference, options)?.load(self)
    }

    /// The definition saved at install time when there is one, otherwise
    /// regular resolution.
    pub fn load_prefer_installed(
        &self,
        token: &str,
        options: ResolveOptions,
    ) -> Result<PackageDefinition, ResolveError> {
        let token = normalize_token(token);
        let installed = self
            .caskroom
            .installed_caskfile(&token)
            .map_err(|err| ResolveError::unavailable(&token, format!("{err:#}")))?;
        match installed {
            Some(path) => Loader::FromInstalledPath { path, token }.load(self),
            None => self.resolve(token, options),
        }
    }

    /// Every installed cask that can be loaded. Ambiguous tokens take the
    /// first candidate; anything else that fails is skipped.
    pub fn installed_definitions(&self) -> Result<Vec<PackageDefinition>> {
        let mut definitions = Vec::new();
        for token in self.caskroom.tokens()? {
            let loaded = match self.load_prefer_installed(&token, ResolveOptions::quiet()) {
                Err(ResolveError::Ambiguous { candidates, .. }) => match candidates.first() {
                    Some(candidate) => candidate.load(self),
                    None => continue,
                },
                other => other,
            };
            match loaded {
                Ok(definition) => definitions.push(definition),
                Err(err) => debug!("skipping installed cask '{token}': {err}"),
            }
        }
        Ok(definitions)
    }
}
