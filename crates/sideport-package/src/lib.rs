//! Package archive decoding: single APKs and XAPK bundles become a
//! [`PackageDescriptor`] ready to hand to the device bridge.

mod archive;
pub mod axml;
mod descriptor;
mod error;
mod manifest;
mod parser;

pub use descriptor::{
    is_valid_package_id, AuxiliaryDataFile, PackageDescriptor, SourceKind, OBB_REMOTE_ROOT,
};
pub use error::ParseError;
pub use parser::{
    check_source, inspect, parse, placeholder_package_id, source_kind, InspectedArchive,
    APK_MANIFEST, AUX_EXTENSION, BUNDLE_EXTENSION, BUNDLE_MANIFEST, ICON_CANDIDATES,
    UNIT_EXTENSION,
};
