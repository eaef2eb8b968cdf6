mod archive;
mod artifact;
mod definition;
mod error;
mod evaluator;
mod token;

pub use archive::ArchiveType;
pub use artifact::{validated_relative_path, ArtifactDescriptor};
pub use definition::{
    CaskRecord, CaskRelations, DefinitionBuilder, PackageDefinition, CASK_METADATA_LEAF,
    LATEST_VERSION, NO_CHECK_SHA256,
};
pub use error::CaskError;
pub use evaluator::{Evaluator, StanzaEvaluator};
pub use token::{
    is_valid_token, normalize_token, validate_token, MigrationTarget, QualifiedToken, TapName,
    DEFAULT_TAP,
};

#[cfg(test)]
mod tests;
