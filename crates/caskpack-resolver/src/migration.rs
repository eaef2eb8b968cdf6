use std::collections::BTreeSet;

use anyhow::{Context, Result};
use caskpack_core::{normalize_token, validate_token, MigrationTarget, QualifiedToken};
use caskpack_registry::TapCatalog;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    Rename,
    Migration,
}

/// Where a qualified token ends up after renames and tap migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResolution {
    pub previous: QualifiedToken,
    pub resolved: QualifiedToken,
    pub kind: Option<ResolutionKind>,
}

impl TokenResolution {
    pub fn changed(&self) -> bool {
        self.previous != self.resolved
    }
}

/// Follows the rename map of the token's tap, or failing that its migration
/// map, recursively. Every reference is visited at most once, so chains and
/// cycles of any length terminate. A notice is logged when `warn` is set and
/// the token changed.
pub fn resolve_token_tap_type(
    catalog: &TapCatalog,
    reference: &QualifiedToken,
    warn: bool,
) -> Result<TokenResolution> {
    let mut visited = BTreeSet::new();
    let (resolved, kind) = resolve_step(catalog, reference, &mut visited)?;
    let resolution = TokenResolution {
        previous: reference.clone(),
        resolved,
        kind,
    };

    if warn {
        if let Some(notice) = resolution_notice(catalog, &resolution) {
            warn!("{notice}");
        }
    }
    Ok(resolution)
}

/// `cask old was renamed to new`, or `migrated` once a tap migration was
/// followed. `None` when the token did not change.
pub fn resolution_notice(catalog: &TapCatalog, resolution: &TokenResolution) -> Option<String> {
    if !resolution.changed() {
        return None;
    }
    let verb = match resolution.kind {
        Some(ResolutionKind::Rename) => "renamed",
        _ => "migrated",
    };
    Some(format!(
        "cask {} was {verb} to {}",
        display_name(catalog, &resolution.previous),
        display_name(catalog, &resolution.resolved)
    ))
}

fn resolve_step(
    catalog: &TapCatalog,
    reference: &QualifiedToken,
    visited: &mut BTreeSet<QualifiedToken>,
) -> Result<(QualifiedToken, Option<ResolutionKind>)> {
    visited.insert(reference.clone());

    let renames = catalog.renames(&reference.tap)?;
    if renames.contains_key(&reference.token) {
        let mut token = reference.token.clone();
        let mut seen = BTreeSet::from([token.clone()]);
        while let Some(next) = renames.get(&token) {
            let next = normalize_token(next);
            if !seen.insert(next.clone()) {
                debug!(tap = %reference.tap, "rename chain loops back to '{next}'");
                break;
            }
            validate_token(&next)
                .with_context(|| format!("invalid rename target in tap '{}'", reference.tap))?;
            token = next;
        }
        if token == reference.token {
            return Ok((reference.clone(), None));
        }
        return Ok((
            QualifiedToken::new(reference.tap.clone(), token),
            Some(ResolutionKind::Rename),
        ));
    }

    let migrations = catalog.migrations(&reference.tap)?;
    let Some(raw_target) = migrations.get(&reference.token) else {
        return Ok((reference.clone(), None));
    };
    let target = MigrationTarget::parse(raw_target)
        .with_context(|| format!("invalid tap migration for {reference}"))?
        .qualify(reference);
    catalog.ensure_installed(&target.tap)?;

    if target == *reference {
        warn!("tap migration for {reference} points to itself, stopping recursion");
        return Ok((reference.clone(), None));
    }
    if visited.contains(&target) {
        warn!("tap migration for {reference} loops back to {target}, stopping recursion");
        return Ok((reference.clone(), None));
    }

    let (resolved, _) = resolve_step(catalog, &target, visited)?;
    let kind = (catalog.is_default(&reference.tap) && resolved.tap != reference.tap)
        .then_some(ResolutionKind::Migration);
    Ok((resolved, kind))
}

fn display_name(catalog: &TapCatalog, reference: &QualifiedToken) -> String {
    if catalog.is_default(&reference.tap) {
        reference.token.clone()
    } else {
        reference.to_string()
    }
}
