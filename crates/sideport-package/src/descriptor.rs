use std::path::{Path, PathBuf};

use serde::Serialize;

/// Guest-side root for expansion data, one directory per package.
pub const OBB_REMOTE_ROOT: &str = "/sdcard/Android/obb";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Apk,
    Xapk,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Apk => "apk",
            SourceKind::Xapk => "xapk",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuxiliaryDataFile {
    package_id: String,
    source: PathBuf,
    file_name: String,
}

impl AuxiliaryDataFile {
    pub(crate) fn new(package_id: &str, source: PathBuf, file_name: String) -> Self {
        Self {
            package_id: package_id.to_string(),
            source,
            file_name,
        }
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn remote_dir(&self) -> String {
        format!("{OBB_REMOTE_ROOT}/{}", self.package_id)
    }

    pub fn remote_path(&self) -> String {
        format!("{}/{}", self.remote_dir(), self.file_name)
    }
}

/// Normalized view of one package archive. Built only by the parser and never
/// mutated afterwards; `units` always holds at least one entry with the base
/// unit first.
#[derive(Clone, Debug, Serialize)]
pub struct PackageDescriptor {
    package_id: String,
    display_name: Option<String>,
    version_name: Option<String>,
    version_code: Option<u64>,
    min_sdk_version: Option<u32>,
    source_kind: SourceKind,
    units: Vec<PathBuf>,
    auxiliary_files: Vec<AuxiliaryDataFile>,
    #[serde(skip)]
    icon: Option<Vec<u8>>,
    placeholder_id: bool,
}

#[derive(Default)]
pub(crate) struct DescriptorParts {
    pub(crate) package_id: String,
    pub(crate) display_name: Option<String>,
    pub(crate) version_name: Option<String>,
    pub(crate) version_code: Option<u64>,
    pub(crate) min_sdk_version: Option<u32>,
    pub(crate) placeholder_id: bool,
}

impl PackageDescriptor {
    pub(crate) fn new(
        parts: DescriptorParts,
        source_kind: SourceKind,
        units: Vec<PathBuf>,
        auxiliary_files: Vec<AuxiliaryDataFile>,
        icon: Option<Vec<u8>>,
    ) -> Self {
        debug_assert!(!units.is_empty());
        Self {
            package_id: parts.package_id,
            display_name: parts.display_name,
            version_name: parts.version_name,
            version_code: parts.version_code,
            min_sdk_version: parts.min_sdk_version,
            source_kind,
            units,
            auxiliary_files,
            icon,
            placeholder_id: parts.placeholder_id,
        }
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn version_name(&self) -> Option<&str> {
        self.version_name.as_deref()
    }

    pub fn version_code(&self) -> Option<u64> {
        self.version_code
    }

    pub fn min_sdk_version(&self) -> Option<u32> {
        self.min_sdk_version
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    pub fn units(&self) -> &[PathBuf] {
        &self.units
    }

    pub fn base_unit(&self) -> &Path {
        &self.units[0]
    }

    pub fn auxiliary_files(&self) -> &[AuxiliaryDataFile] {
        &self.auxiliary_files
    }

    pub fn icon(&self) -> Option<&[u8]> {
        self.icon.as_deref()
    }

    /// True when the identifier was synthesized from the file name because the
    /// embedded manifest could not be read.
    pub fn has_placeholder_id(&self) -> bool {
        self.placeholder_id
    }

    /// Human-readable label: display name, else the package id.
    pub fn label(&self) -> &str {
        self.display_name().unwrap_or(&self.package_id)
    }
}

/// Package ids end up in guest paths and shell commands, so only the
/// characters Android allows in an application id are accepted.
pub fn is_valid_package_id(value: &str) -> bool {
    let mut segments = 0;
    for segment in value.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        segments += 1;
    }
    segments >= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auxiliary_remote_path_follows_obb_convention() {
        let file = AuxiliaryDataFile::new(
            "com.example.game",
            PathBuf::from("/tmp/x/main.7.com.example.game.obb"),
            "main.7.com.example.game.obb".into(),
        );
        assert_eq!(file.remote_dir(), "/sdcard/Android/obb/com.example.game");
        assert_eq!(
            file.remote_path(),
            "/sdcard/Android/obb/com.example.game/main.7.com.example.game.obb"
        );
    }

    #[test]
    fn package_id_validation() {
        assert!(is_valid_package_id("com.example.app"));
        assert!(is_valid_package_id("com.example_2.App3"));
        assert!(is_valid_package_id("local"));
        assert!(!is_valid_package_id(""));
        assert!(!is_valid_package_id("com..example"));
        assert!(!is_valid_package_id("com.1example"));
        assert!(!is_valid_package_id("com.example;rm -rf /"));
        assert!(!is_valid_package_id("../etc"));
    }
}
