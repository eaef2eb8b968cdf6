use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context;
use caskpack_core::{
    is_valid_token, normalize_token, CaskRecord, PackageDefinition, QualifiedToken, TapName,
};
use caskpack_installer::read_installed_tap;
use regex::Regex;
use tracing::debug;

use crate::error::ResolveError;
use crate::migration::resolve_token_tap_type;
use crate::resolver::Resolver;

pub const URI_SCHEMES: &[&str] = &["http", "https", "ftp", "file"];

/// A whole definition: `cask "token" do ... end` or `cask("token") { ... }`.
static CONTENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?sm)\A\s*cask(?:\s+"[^"\n]+"\s+do\s*\n.*?^\s*end|\s*\(\s*"[^"\n]+"\s*\)\s*\{\s*\n.*?^\s*\})\s*\z"#,
    )
    .expect("content pattern is valid")
});

/// What the user handed the resolver.
#[derive(Debug, Clone)]
pub enum Reference {
    Definition(Box<PackageDefinition>),
    Text(String),
    Path(PathBuf),
}

impl Reference {
    fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// A bare token, normalized; `None` for anything qualified or invalid.
    pub fn bare_token(&self) -> Option<String> {
        let token = normalize_token(self.text()?);
        is_valid_token(&token).then_some(token)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Definition(definition) => definition.full_token(),
            Self::Text(text) => text.trim().to_string(),
            Self::Path(path) => path.display().to_string(),
        }
    }
}

impl From<PackageDefinition> for Reference {
    fn from(value: PackageDefinition) -> Self {
        Self::Definition(Box::new(value))
    }
}

impl From<&str> for Reference {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Reference {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<PathBuf> for Reference {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for Reference {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    FromInstance,
    FromContent,
    FromUri,
    FromApi,
    FromRepository,
    FromName,
    FromPath,
    FromInstalledPath,
}

/// Loader kinds in the order they are offered a reference. The first one to
/// accept it wins; nothing matching falls through to [`Loader::Null`].
pub const LOADER_PRIORITY: [LoaderKind; 8] = [
    LoaderKind::FromInstance,
    LoaderKind::FromContent,
    LoaderKind::FromUri,
    LoaderKind::FromApi,
    LoaderKind::FromRepository,
    LoaderKind::FromName,
    LoaderKind::FromPath,
    LoaderKind::FromInstalledPath,
];

#[derive(Debug, Clone)]
pub enum Loader {
    FromInstance(Box<PackageDefinition>),
    FromContent {
        content: String,
    },
    FromUri {
        url: String,
        token: String,
    },
    FromApi {
        tap: TapName,
        token: String,
    },
    FromRepository {
        tap: TapName,
        token: String,
        path: PathBuf,
    },
    FromPath {
        path: PathBuf,
        token: String,
        tap: Option<TapName>,
    },
    FromInstalledPath {
        path: PathBuf,
        token: String,
    },
    Null {
        reference: String,
    },
}

impl LoaderKind {
    pub fn try_create(
        self,
        resolver: &Resolver,
        reference: &Reference,
        warn: bool,
    ) -> Result<Option<Loader>, ResolveError> {
        match self {
            Self::FromInstance => Ok(match reference {
                Reference::Definition(definition) => Some(Loader::FromInstance(definition.clone())),
                _ => None,
            }),
            Self::FromContent => Ok(reference
                .text()
                .filter(|text| CONTENT_PATTERN.is_match(text))
                .map(|text| Loader::FromContent {
                    content: text.to_string(),
                })),
            Self::FromUri => Ok(reference.text().and_then(uri_loader)),
            Self::FromApi => api_loader(resolver, reference, warn),
            Self::FromRepository => {
                let Some(qualified) = reference
                    .text()
                    .filter(|text| !names_definition_file(text))
                    .and_then(QualifiedToken::parse)
                else {
                    return Ok(None);
                };
                tap_loader(resolver, &qualified, warn).map(Some)
            }
            Self::FromName => name_loader(resolver, reference, warn),
            Self::FromPath => Ok(path_loader(resolver, reference)),
            Self::FromInstalledPath => {
                let Some(token) = reference.bare_token() else {
                    return Ok(None);
                };
                let path = resolver
                    .caskroom()
                    .installed_caskfile(&token)
                    .map_err(|err| ResolveError::unavailable(&token, format!("{err:#}")))?;
                Ok(path.map(|path| Loader::FromInstalledPath { path, token }))
            }
        }
    }
}

fn uri_loader(text: &str) -> Option<Loader> {
    let text = text.trim();
    let (scheme, rest) = text.split_once("://")?;
    if !URI_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) || rest.is_empty() {
        return None;
    }
    let path = rest.split(['?', '#']).next().unwrap_or(rest);
    let token = Path::new(path)
        .file_stem()
        .map(|stem| normalize_token(&stem.to_string_lossy()))
        .unwrap_or_default();
    Some(Loader::FromUri {
        url: text.to_string(),
        token,
    })
}

/// Bare or default-tap-qualified tokens present in the API index, renames
/// applied, while the default tap is not installed locally.
fn api_loader(
    resolver: &Resolver,
    reference: &Reference,
    warn: bool,
) -> Result<Option<Loader>, ResolveError> {
    let catalog = resolver.catalog();
    let default_tap = catalog.default_tap_name();
    if !catalog.uses_api(default_tap) {
        return Ok(None);
    }

    let qualified = match reference.bare_token() {
        Some(token) => QualifiedToken::new(default_tap.clone(), token),
        None => match reference.text().and_then(QualifiedToken::parse) {
            Some(qualified) if qualified.tap == *default_tap => qualified,
            _ => return Ok(None),
        },
    };

    let index = catalog
        .api_index()
        .map_err(|err| ResolveError::unavailable(qualified.to_string(), format!("{err:#}")))?;
    let Some(index) = index else {
        return Ok(None);
    };
    let renamed = catalog
        .renames(default_tap)
        .map(|renames| renames.contains_key(&qualified.token))
        .unwrap_or(false);
    if !index.contains(&qualified.token) && !renamed {
        return Ok(None);
    }

    let resolution = resolve_token_tap_type(catalog, &qualified, warn)
        .map_err(|err| ResolveError::unavailable(qualified.to_string(), format!("{err:#}")))?;
    let resolved = resolution.resolved;
    if resolved.tap != *default_tap || !index.contains(&resolved.token) {
        return Ok(None);
    }
    Ok(Some(Loader::FromApi {
        tap: resolved.tap,
        token: resolved.token,
    }))
}

/// Renames and migrations first, then the tap's definition file. An absent
/// default tap is served from the API when the index knows the token.
pub(crate) fn tap_loader(
    resolver: &Resolver,
    reference: &QualifiedToken,
    warn: bool,
) -> Result<Loader, ResolveError> {
    let catalog = resolver.catalog();
    let resolution = resolve_token_tap_type(catalog, reference, warn)
        .map_err(|err| ResolveError::unavailable(reference.to_string(), format!("{err:#}")))?;
    let QualifiedToken { tap, token } = resolution.resolved;

    if catalog.uses_api(&tap) {
        let index = catalog
            .api_index()
            .map_err(|err| ResolveError::unavailable(reference.to_string(), format!("{err:#}")))?;
        if index.is_some_and(|index| index.contains(&token)) {
            return Ok(Loader::FromApi { tap, token });
        }
    }

    let repository = catalog.tap(&tap);
    let path = repository
        .cask_file(&token)
        .unwrap_or_else(|| repository.expected_cask_file(&token));
    Ok(Loader::FromRepository { tap, token, path })
}

/// A bare token looked up across taps. The default tap wins outright when it
/// has a file for the token; otherwise every other installed tap is asked.
fn name_loader(
    resolver: &Resolver,
    reference: &Reference,
    warn: bool,
) -> Result<Option<Loader>, ResolveError> {
    let Some(token) = reference.bare_token() else {
        return Ok(None);
    };
    let catalog = resolver.catalog();

    let default_tap = catalog.default_tap();
    if default_tap.is_installed() {
        let qualified = QualifiedToken::new(default_tap.name().clone(), token.clone());
        let loader = tap_loader(resolver, &qualified, warn)?;
        if loader.path().is_some_and(Path::exists) {
            return Ok(Some(loader));
        }
    }

    let taps = catalog
        .installed_taps()
        .map_err(|err| ResolveError::unavailable(&token, format!("{err:#}")))?;
    let mut seen_paths = BTreeSet::new();
    let mut candidates = Vec::new();
    for tap in taps.iter().filter(|tap| !catalog.is_default(tap.name())) {
        let qualified = QualifiedToken::new(tap.name().clone(), token.clone());
        let loader = match tap_loader(resolver, &qualified, warn) {
            Ok(loader) => loader,
            Err(err) => {
                debug!("skipping {qualified}: {err}");
                continue;
            }
        };
        if let Some(path) = loader.path() {
            if !seen_paths.insert(path.to_path_buf()) || !path.exists() {
                continue;
            }
        }
        candidates.push(loader);
    }

    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop()),
        _ => Err(ResolveError::Ambiguous { token, candidates }),
    }
}

/// An existing `.cask`/`.json` file wins over an `owner/repo/token` reading.
fn names_definition_file(text: &str) -> bool {
    let path = Path::new(text.trim());
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "cask" | "json"))
        && path.is_file()
}

fn path_loader(resolver: &Resolver, reference: &Reference) -> Option<Loader> {
    let path = match reference {
        Reference::Path(path) => path.clone(),
        Reference::Text(text) => PathBuf::from(text.trim()),
        Reference::Definition(_) => return None,
    };
    let extension = path.extension()?.to_str()?;
    if !matches!(extension, "cask" | "json") || !path.is_file() {
        return None;
    }
    let token = normalize_token(&path.file_stem()?.to_string_lossy());
    let tap = tap_of_path(resolver.catalog().taps_root(), &path);
    Some(Loader::FromPath { path, token, tap })
}

/// `<taps root>/<owner>/<repo>/...` names its tap.
fn tap_of_path(taps_root: &Path, path: &Path) -> Option<TapName> {
    let relative = path.strip_prefix(taps_root).ok()?;
    let mut components = relative.components();
    let owner = components.next()?.as_os_str().to_str()?;
    let repo = components.next()?.as_os_str().to_str()?;
    TapName::new(owner, repo).ok()
}

impl Loader {
    pub fn kind(&self) -> Option<LoaderKind> {
        match self {
            Self::FromInstance(_) => Some(LoaderKind::FromInstance),
            Self::FromContent { .. } => Some(LoaderKind::FromContent),
            Self::FromUri { .. } => Some(LoaderKind::FromUri),
            Self::FromApi { .. } => Some(LoaderKind::FromApi),
            Self::FromRepository { .. } => Some(LoaderKind::FromRepository),
            Self::FromPath { .. } => Some(LoaderKind::FromPath),
            Self::FromInstalledPath { .. } => Some(LoaderKind::FromInstalledPath),
            Self::Null { .. } => None,
        }
    }

    /// Definition file backing this loader, if it reads one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::FromRepository { path, .. }
            | Self::FromPath { path, .. }
            | Self::FromInstalledPath { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn load(&self, resolver: &Resolver) -> Result<PackageDefinition, ResolveError> {
        match self {
            Self::FromInstance(definition) => Ok((**definition).clone()),
            Self::FromContent { content } => resolver
                .evaluator()
                .evaluate(content)
                .map_err(|err| ResolveError::unreadable("<content>", err)),
            Self::FromUri { url, token } => load_uri(resolver, url, token),
            Self::FromApi { tap, token } => {
                let index = resolver
                    .catalog()
                    .api_index()
                    .map_err(|err| ResolveError::unavailable(token, format!("{err:#}")))?;
                let record = index
                    .and_then(|index| index.record(token))
                    .ok_or_else(|| ResolveError::unavailable(token, "not found in the API index"))?;
                let definition = record
                    .replay()
                    .map_err(|err| ResolveError::unreadable(token, err))?;
                check_token(token, definition)
                    .map(|definition| definition.with_tap(Some(tap.clone())))
            }
            Self::FromRepository { tap, token, path } => {
                if !path.is_file() {
                    return Err(ResolveError::unavailable(
                        format!("{tap}/{token}"),
                        format!("no cask with this name exists in tap '{tap}'"),
                    ));
                }
                load_file(resolver, path, token, Some(tap.clone()))
            }
            Self::FromPath { path, token, tap } => load_file(resolver, path, token, tap.clone()),
            Self::FromInstalledPath { path, token } => {
                let tap = read_installed_tap(path)
                    .map_err(|err| ResolveError::unreadable(token, err))?;
                load_file(resolver, path, token, tap)
            }
            Self::Null { reference } => Err(ResolveError::unavailable(
                reference,
                "no cask with this name exists",
            )),
        }
    }
}

impl fmt::Display for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromInstance(definition) => write!(f, "{}", definition.full_token()),
            Self::FromContent { .. } => write!(f, "<content>"),
            Self::FromUri { url, .. } => write!(f, "{url}"),
            Self::FromApi { tap, token } | Self::FromRepository { tap, token, .. } => {
                write!(f, "{tap}/{token}")
            }
            Self::FromPath { path, .. } | Self::FromInstalledPath { path, .. } => {
                write!(f, "{}", path.display())
            }
            Self::Null { reference } => write!(f, "{reference}"),
        }
    }
}

fn load_uri(
    resolver: &Resolver,
    url: &str,
    token: &str,
) -> Result<PackageDefinition, ResolveError> {
    if let Some(local) = url.strip_prefix("file://") {
        let path = Path::new(local);
        if !path.is_file() {
            return Err(ResolveError::unavailable(
                token,
                format!("{} does not exist", path.display()),
            ));
        }
        return load_file(resolver, path, token, None);
    }
    if url.to_ascii_lowercase().starts_with("ftp://") {
        return Err(ResolveError::unavailable(token, "ftp downloads are not supported"));
    }

    debug!(url, "fetching definition");
    let content = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.text())
        .map_err(|err| ResolveError::unavailable(token, format!("failed to fetch {url}: {err}")))?;
    let is_json = url
        .split(['?', '#'])
        .next()
        .is_some_and(|path| path.ends_with(".json"));
    let definition = evaluate(resolver, &content, is_json, token)?;
    check_token(token, definition)
}

fn load_file(
    resolver: &Resolver,
    path: &Path,
    token: &str,
    tap: Option<TapName>,
) -> Result<PackageDefinition, ResolveError> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))
        .map_err(|err| ResolveError::unavailable(token, format!("{err:#}")))?;
    let is_json = path.extension().is_some_and(|extension| extension == "json");
    let definition = check_token(token, evaluate(resolver, &content, is_json, token)?)?;
    let tap = tap.or_else(|| definition.tap.clone());
    Ok(definition.with_source_path(path).with_tap(tap))
}

fn evaluate(
    resolver: &Resolver,
    content: &str,
    is_json: bool,
    token: &str,
) -> Result<PackageDefinition, ResolveError> {
    let result = if is_json {
        CaskRecord::from_json_str(content)
            .and_then(|record| record.replay())
            .map(|mut definition| {
                definition.loaded_from_api = false;
                definition
            })
    } else {
        resolver.evaluator().evaluate(content)
    };
    result.map_err(|err| ResolveError::unreadable(token, err))
}

fn check_token(
    expected: &str,
    definition: PackageDefinition,
) -> Result<PackageDefinition, ResolveError> {
    if definition.token != expected {
        return Err(ResolveError::TokenMismatch {
            expected: expected.to_string(),
            actual: definition.token,
        });
    }
    Ok(definition)
}
