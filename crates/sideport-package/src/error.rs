use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("package source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("unsupported package extension: {0:?} (expected .apk or .xapk)")]
    UnsupportedExtension(String),

    #[error("archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("bundle has no manifest.json")]
    ManifestMissing,

    #[error("bundle manifest is invalid: {0}")]
    ManifestInvalid(String),

    #[error("bundle contains no installable units")]
    NoInstallableUnits,

    #[error("bundle has no base unit (found: {})", .units.join(", "))]
    NoBaseUnit { units: Vec<String> },

    #[error("scratch directory error: {0}")]
    Io(#[from] io::Error),
}

impl ParseError {
    /// Stable classification used in job failures and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::SourceNotFound(_) => "parse.source_not_found",
            ParseError::UnsupportedExtension(_) => "parse.unsupported_extension",
            ParseError::ArchiveCorrupt(_) => "parse.archive_corrupt",
            ParseError::ManifestMissing => "parse.manifest_missing",
            ParseError::ManifestInvalid(_) => "parse.manifest_invalid",
            ParseError::NoInstallableUnits => "parse.no_installable_units",
            ParseError::NoBaseUnit { .. } => "parse.no_base_unit",
            ParseError::Io(_) => "parse.io",
        }
    }
}

impl From<zip::result::ZipError> for ParseError {
    fn from(err: zip::result::ZipError) -> Self {
        ParseError::ArchiveCorrupt(err.to_string())
    }
}
