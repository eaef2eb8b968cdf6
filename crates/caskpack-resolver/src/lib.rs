mod error;
mod loader;
mod migration;
mod resolver;

pub use error::ResolveError;
pub use loader::{Loader, LoaderKind, Reference, LOADER_PRIORITY, URI_SCHEMES};
pub use migration::{
    resolution_notice, resolve_token_tap_type, ResolutionKind, TokenResolution,
};
pub use resolver::{ResolveOptions, Resolver};
