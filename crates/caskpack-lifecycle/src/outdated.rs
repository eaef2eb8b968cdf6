use caskpack_core::PackageDefinition;

/// Opt-ins for casks whose installed version says little about freshness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GreedyFlags {
    pub greedy: bool,
    pub greedy_latest: bool,
    pub greedy_auto_updates: bool,
}

impl GreedyFlags {
    pub fn any(&self) -> bool {
        self.greedy || self.greedy_latest || self.greedy_auto_updates
    }

    /// Allow-listed tokens behave as if `greedy` were set.
    pub fn with_allowlisted(mut self, allowlisted: bool) -> Self {
        self.greedy |= allowlisted;
        self
    }

    /// Whether `definition` falls in a greedy category these flags enable.
    pub fn includes(&self, definition: &PackageDefinition) -> bool {
        (definition.is_latest() && (self.greedy || self.greedy_latest))
            || (definition.auto_updates && (self.greedy || self.greedy_auto_updates))
    }
}

/// An installed cask paired with the definition it would upgrade to.
#[derive(Debug, Clone, PartialEq)]
pub struct OutdatedCask {
    pub installed: PackageDefinition,
    pub current: PackageDefinition,
}

impl OutdatedCask {
    pub fn token(&self) -> &str {
        &self.installed.token
    }

    pub fn describe(&self) -> String {
        format!(
            "{} {} -> {}",
            self.current.full_token(),
            self.installed.version,
            self.current.version
        )
    }
}

pub fn is_outdated(installed_version: &str, current: &PackageDefinition, flags: GreedyFlags) -> bool {
    installed_version != current.version || flags.includes(current)
}
