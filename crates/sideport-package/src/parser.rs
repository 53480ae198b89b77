use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::archive;
use crate::axml;
use crate::descriptor::{
    is_valid_package_id, AuxiliaryDataFile, DescriptorParts, PackageDescriptor, SourceKind,
};
use crate::error::ParseError;
use crate::manifest::XapkManifest;

pub const UNIT_EXTENSION: &str = "apk";
pub const BUNDLE_EXTENSION: &str = "xapk";
pub const AUX_EXTENSION: &str = "obb";
pub const BUNDLE_MANIFEST: &str = "manifest.json";
pub const APK_MANIFEST: &str = "AndroidManifest.xml";
pub const ICON_CANDIDATES: [&str; 4] = ["icon.png", "Icon.png", "app_icon.png", "icon.webp"];

/// Classifies a source path by extension without touching the file.
pub fn source_kind(path: &Path) -> Result<SourceKind, ParseError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        UNIT_EXTENSION => Ok(SourceKind::Apk),
        BUNDLE_EXTENSION => Ok(SourceKind::Xapk),
        _ => Err(ParseError::UnsupportedExtension(ext)),
    }
}

/// Checks that `path` is an existing file with a recognized extension.
pub fn check_source(path: &Path) -> Result<SourceKind, ParseError> {
    let kind = source_kind(path)?;
    if !path.is_file() {
        return Err(ParseError::SourceNotFound(path.to_path_buf()));
    }
    Ok(kind)
}

/// Parses an archive in one go. `scratch` receives the expanded bundle and must
/// outlive the returned descriptor's paths.
pub fn parse(path: &Path, scratch: &Path) -> Result<PackageDescriptor, ParseError> {
    inspect(path)?.extract(scratch)
}

/// An archive whose metadata has been read but whose contents have not been
/// expanded yet.
#[derive(Debug)]
pub struct InspectedArchive {
    path: PathBuf,
    kind: SourceKind,
    parts: Metadata,
    expansions: Vec<String>,
}

#[derive(Debug, Default)]
struct Metadata {
    package_id: String,
    display_name: Option<String>,
    version_name: Option<String>,
    version_code: Option<u64>,
    min_sdk_version: Option<u32>,
    placeholder_id: bool,
}

impl From<Metadata> for DescriptorParts {
    fn from(m: Metadata) -> Self {
        DescriptorParts {
            package_id: m.package_id,
            display_name: m.display_name,
            version_name: m.version_name,
            version_code: m.version_code,
            min_sdk_version: m.min_sdk_version,
            placeholder_id: m.placeholder_id,
        }
    }
}

/// Opens the archive and reads its identifying metadata.
pub fn inspect(path: &Path) -> Result<InspectedArchive, ParseError> {
    let kind = check_source(path)?;
    let mut zip = archive::open(path)?;
    match kind {
        SourceKind::Apk => {
            let parts = apk_metadata(path, &mut zip)?;
            Ok(InspectedArchive {
                path: path.to_path_buf(),
                kind,
                parts,
                expansions: Vec::new(),
            })
        }
        SourceKind::Xapk => {
            let data =
                archive::read_entry(&mut zip, BUNDLE_MANIFEST)?.ok_or(ParseError::ManifestMissing)?;
            let manifest = XapkManifest::from_slice(&data)?;
            let parts = Metadata {
                package_id: manifest.package_id(),
                display_name: manifest.display_name(),
                version_name: manifest.version_name(),
                version_code: manifest.version_code(),
                min_sdk_version: manifest.min_sdk_version(),
                placeholder_id: false,
            };
            Ok(InspectedArchive {
                path: path.to_path_buf(),
                kind,
                parts,
                expansions: manifest.expansions.into_iter().map(|e| e.file).collect(),
            })
        }
    }
}

impl InspectedArchive {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn package_id(&self) -> &str {
        &self.parts.package_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expands a bundle under `scratch` and builds the descriptor. A single APK
    /// is its own only unit and is not copied.
    pub fn extract(self, scratch: &Path) -> Result<PackageDescriptor, ParseError> {
        match self.kind {
            SourceKind::Apk => Ok(PackageDescriptor::new(
                self.parts.into(),
                SourceKind::Apk,
                vec![self.path],
                Vec::new(),
                None,
            )),
            SourceKind::Xapk => {
                let mut zip = archive::open(&self.path)?;
                archive::extract_all(&mut zip, scratch)?;
                describe_bundle(scratch, self.parts, &self.expansions)
            }
        }
    }
}

fn apk_metadata(path: &Path, zip: &mut archive::Archive) -> Result<Metadata, ParseError> {
    let parsed = archive::read_entry(zip, APK_MANIFEST)?
        .map(|data| axml::parse_manifest(&data));
    match parsed {
        Some(Ok(info)) if info.package.as_deref().is_some_and(is_valid_package_id) => {
            Ok(Metadata {
                package_id: info.package.unwrap_or_default(),
                display_name: None,
                version_name: info.version_name,
                version_code: info.version_code,
                min_sdk_version: info.min_sdk_version,
                placeholder_id: false,
            })
        }
        other => {
            let id = placeholder_package_id(path);
            match other {
                Some(Err(err)) => warn!("{}: unreadable {APK_MANIFEST} ({err}); using {id}", path.display()),
                Some(Ok(_)) => warn!("{}: manifest has no usable package; using {id}", path.display()),
                None => warn!("{}: no {APK_MANIFEST}; using {id}", path.display()),
            }
            Ok(Metadata {
                package_id: id,
                placeholder_id: true,
                ..Metadata::default()
            })
        }
    }
}

/// Fallback identifier derived from the file stem. Two unrelated files with
/// the same name collide, which is why it is only used when the manifest
/// cannot be read.
pub fn placeholder_package_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut segment: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if segment.is_empty() || segment.starts_with(|c: char| c.is_ascii_digit()) {
        segment.insert(0, '_');
    }
    format!("local.{segment}")
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn is_base_candidate(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("base") || !lower.contains("split")
}

/// Sorts units by file name and moves the base unit to the front. A name
/// containing "base" wins over one that merely lacks "split", and
/// `<package>.apk` wins among the latter.
pub(crate) fn order_units(
    mut units: Vec<PathBuf>,
    package_id: &str,
) -> Result<Vec<PathBuf>, ParseError> {
    if units.is_empty() {
        return Err(ParseError::NoInstallableUnits);
    }
    units.sort_by(|a, b| file_name_of(a).cmp(&file_name_of(b)).then_with(|| a.cmp(b)));

    let named = format!("{package_id}.{UNIT_EXTENSION}");
    let base_index = units
        .iter()
        .position(|p| file_name_of(p).to_ascii_lowercase().contains("base"))
        .or_else(|| units.iter().position(|p| file_name_of(p) == named))
        .or_else(|| units.iter().position(|p| is_base_candidate(&file_name_of(p))));

    let Some(index) = base_index else {
        return Err(ParseError::NoBaseUnit {
            units: units.iter().map(|p| file_name_of(p)).collect(),
        });
    };
    let base = units.remove(index);
    units.insert(0, base);
    Ok(units)
}

fn describe_bundle(
    root: &Path,
    parts: Metadata,
    expansions: &[String],
) -> Result<PackageDescriptor, ParseError> {
    let units: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && has_extension(e.path(), UNIT_EXTENSION))
        .map(|e| e.into_path())
        .collect();
    let units = order_units(units, &parts.package_id)?;

    let auxiliary_files = auxiliary_files(root, &parts.package_id, expansions)?;
    let icon = ICON_CANDIDATES
        .iter()
        .map(|name| root.join(name))
        .find(|p| p.is_file())
        .and_then(|p| match fs::read(&p) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!("failed to read icon {}: {err}", p.display());
                None
            }
        });

    debug!(
        "bundle {}: {} units, {} auxiliary files",
        parts.package_id,
        units.len(),
        auxiliary_files.len()
    );
    Ok(PackageDescriptor::new(
        parts.into(),
        SourceKind::Xapk,
        units,
        auxiliary_files,
        icon,
    ))
}

fn auxiliary_files(
    root: &Path,
    package_id: &str,
    expansions: &[String],
) -> Result<Vec<AuxiliaryDataFile>, ParseError> {
    let mut sources: Vec<PathBuf> = Vec::new();
    let obb_dir = root.join("Android").join("obb").join(package_id);
    if obb_dir.is_dir() {
        for entry in fs::read_dir(&obb_dir)? {
            let path = entry?.path();
            if path.is_file() && has_extension(&path, AUX_EXTENSION) {
                sources.push(path);
            }
        }
    }

    // Bundlers that declare expansions sometimes store them elsewhere.
    for file in expansions {
        let relative = Path::new(file);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            warn!("ignoring expansion {file:?} outside the bundle root");
            continue;
        }
        let path = root.join(relative);
        if path.is_file() {
            sources.push(path);
        } else {
            warn!("declared expansion {file:?} not present in bundle");
        }
    }

    let mut seen = HashSet::new();
    let mut files: Vec<AuxiliaryDataFile> = sources
        .into_iter()
        .filter_map(|path| {
            let name = file_name_of(&path);
            seen.insert(name.clone())
                .then(|| AuxiliaryDataFile::new(package_id, path, name))
        })
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(b.file_name()));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::{write::FileOptions, ZipWriter};

    use super::*;
    use crate::axml::tests::encode_manifest;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn names(desc: &PackageDescriptor) -> Vec<String> {
        desc.units().iter().map(|p| file_name_of(p)).collect()
    }

    const MANIFEST: &[u8] =
        br#"{"package_name":"com.example.game","name":"Example Game","version_name":"2.0","version_code":20}"#;

    #[test]
    fn single_apk_reads_identity_from_binary_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("whatever.apk");
        let manifest = encode_manifest("com.example.real", 77, "7.7", 26);
        write_zip(&apk, &[(APK_MANIFEST, &manifest), ("classes.dex", b"dex")]);

        let desc = parse(&apk, &dir.path().join("scratch")).unwrap();
        assert_eq!(desc.package_id(), "com.example.real");
        assert_eq!(desc.version_code(), Some(77));
        assert_eq!(desc.version_name(), Some("7.7"));
        assert_eq!(desc.min_sdk_version(), Some(26));
        assert_eq!(desc.units(), &[apk]);
        assert!(!desc.has_placeholder_id());
    }

    #[test]
    fn single_apk_without_metadata_falls_back_to_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("My Cool-App.apk");
        write_zip(&apk, &[("classes.dex", b"dex")]);

        let desc = parse(&apk, &dir.path().join("scratch")).unwrap();
        assert_eq!(desc.units().len(), 1);
        assert_eq!(desc.package_id(), "local.my_cool_app");
        assert!(desc.has_placeholder_id());
        assert!(desc.auxiliary_files().is_empty());
    }

    #[test]
    fn bundle_units_are_base_first_then_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let xapk = dir.path().join("game.xapk");
        write_zip(
            &xapk,
            &[
                (BUNDLE_MANIFEST, MANIFEST),
                ("split_b.apk", b"b"),
                ("config/split_a.apk", b"a"),
                ("base.apk", b"base"),
                ("icon.png", b"\x89PNG"),
            ],
        );

        let first = parse(&xapk, &dir.path().join("s1")).unwrap();
        assert_eq!(names(&first), ["base.apk", "split_a.apk", "split_b.apk"]);
        assert_eq!(first.package_id(), "com.example.game");
        assert_eq!(first.display_name(), Some("Example Game"));
        assert_eq!(first.version_code(), Some(20));
        assert_eq!(first.icon(), Some(&b"\x89PNG"[..]));

        let second = parse(&xapk, &dir.path().join("s2")).unwrap();
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn package_named_unit_is_base_when_nothing_says_base() {
        let units = vec![
            PathBuf::from("/s/config.arm64_v8a.apk"),
            PathBuf::from("/s/com.example.game.apk"),
        ];
        let ordered = order_units(units, "com.example.game").unwrap();
        assert_eq!(ordered[0], PathBuf::from("/s/com.example.game.apk"));
    }

    #[test]
    fn bundle_without_base_unit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let xapk = dir.path().join("game.xapk");
        write_zip(
            &xapk,
            &[
                (BUNDLE_MANIFEST, MANIFEST),
                ("split_a.apk", b"a"),
                ("split_b.apk", b"b"),
            ],
        );
        let err = parse(&xapk, &dir.path().join("scratch")).unwrap_err();
        match err {
            ParseError::NoBaseUnit { units } => assert_eq!(units, ["split_a.apk", "split_b.apk"]),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn bundle_without_units_fails() {
        let dir = tempfile::tempdir().unwrap();
        let xapk = dir.path().join("game.xapk");
        write_zip(&xapk, &[(BUNDLE_MANIFEST, MANIFEST), ("readme.txt", b"hi")]);
        let err = parse(&xapk, &dir.path().join("scratch")).unwrap_err();
        assert!(matches!(err, ParseError::NoInstallableUnits));
    }

    #[test]
    fn bundle_manifest_errors_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.xapk");
        write_zip(&missing, &[("base.apk", b"x")]);
        assert!(matches!(
            inspect(&missing).unwrap_err(),
            ParseError::ManifestMissing
        ));

        let invalid = dir.path().join("invalid.xapk");
        write_zip(&invalid, &[(BUNDLE_MANIFEST, b"{oops"), ("base.apk", b"x")]);
        assert!(matches!(
            inspect(&invalid).unwrap_err(),
            ParseError::ManifestInvalid(_)
        ));
    }

    #[test]
    fn auxiliary_data_is_discovered_under_obb_convention() {
        let dir = tempfile::tempdir().unwrap();
        let xapk = dir.path().join("game.xapk");
        write_zip(
            &xapk,
            &[
                (
                    BUNDLE_MANIFEST,
                    br#"{"package_name":"com.example.game","expansions":[{"file":"Android/obb/com.example.game/main.20.com.example.game.obb","install_location":"EXTERNAL_STORAGE"},{"file":"extra/patch.20.com.example.game.obb"}]}"#,
                ),
                ("com.example.game.apk", b"base"),
                ("Android/obb/com.example.game/main.20.com.example.game.obb", b"main"),
                ("Android/obb/com.example.game/notes.txt", b"skip"),
                ("extra/patch.20.com.example.game.obb", b"patch"),
            ],
        );

        let desc = parse(&xapk, &dir.path().join("scratch")).unwrap();
        let aux: Vec<&str> = desc.auxiliary_files().iter().map(|f| f.file_name()).collect();
        assert_eq!(
            aux,
            ["main.20.com.example.game.obb", "patch.20.com.example.game.obb"]
        );
        assert_eq!(
            desc.auxiliary_files()[0].remote_path(),
            "/sdcard/Android/obb/com.example.game/main.20.com.example.game.obb"
        );
    }

    #[test]
    fn entries_escaping_the_scratch_dir_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let xapk = dir.path().join("evil.xapk");
        write_zip(
            &xapk,
            &[(BUNDLE_MANIFEST, MANIFEST), ("../../evil.apk", b"x"), ("base.apk", b"x")],
        );
        let err = parse(&xapk, &dir.path().join("scratch")).unwrap_err();
        assert!(matches!(err, ParseError::ArchiveCorrupt(_)), "{err}");
        assert!(!dir.path().join("evil.apk").exists());
    }

    #[test]
    fn source_checks_happen_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            check_source(&dir.path().join("notes.zip")).unwrap_err(),
            ParseError::UnsupportedExtension(ext) if ext == "zip"
        ));
        assert!(matches!(
            check_source(&dir.path().join("absent.XAPK")).unwrap_err(),
            ParseError::SourceNotFound(_)
        ));

        let garbage = dir.path().join("garbage.apk");
        fs::write(&garbage, b"definitely not a zip").unwrap();
        assert!(matches!(
            inspect(&garbage).unwrap_err(),
            ParseError::ArchiveCorrupt(_)
        ));
    }

    #[test]
    fn placeholder_ids_are_valid_package_ids() {
        for name in ["app.apk", "123 go!.apk", ".apk", "Übung.apk"] {
            let id = placeholder_package_id(Path::new(name));
            assert!(is_valid_package_id(&id), "{name} -> {id}");
        }
    }
}
