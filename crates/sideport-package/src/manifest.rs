use serde::Deserialize;
use serde_json::Value;

use crate::descriptor::is_valid_package_id;
use crate::error::ParseError;

/// The `manifest.json` at the root of an XAPK bundle.
#[derive(Debug, Deserialize)]
pub(crate) struct XapkManifest {
    pub(crate) package_name: String,
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) version_name: Option<String>,
    #[serde(default)]
    version_code: Option<Value>,
    #[serde(default)]
    min_sdk_version: Option<Value>,
    #[serde(default)]
    pub(crate) expansions: Vec<XapkExpansion>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct XapkExpansion {
    pub(crate) file: String,
}

impl XapkManifest {
    pub(crate) fn from_slice(data: &[u8]) -> Result<Self, ParseError> {
        let manifest: XapkManifest = serde_json::from_slice(data)
            .map_err(|err| ParseError::ManifestInvalid(err.to_string()))?;
        let package = manifest.package_name.trim();
        if package.is_empty() {
            return Err(ParseError::ManifestInvalid("package_name is empty".into()));
        }
        if !is_valid_package_id(package) {
            return Err(ParseError::ManifestInvalid(format!(
                "package_name {package:?} is not a valid application id"
            )));
        }
        Ok(manifest)
    }

    pub(crate) fn package_id(&self) -> String {
        self.package_name.trim().to_string()
    }

    pub(crate) fn display_name(&self) -> Option<String> {
        non_empty(self.name.as_deref())
    }

    pub(crate) fn version_name(&self) -> Option<String> {
        non_empty(self.version_name.as_deref())
    }

    // Bundlers disagree on whether these are strings or numbers.
    pub(crate) fn version_code(&self) -> Option<u64> {
        self.version_code.as_ref().and_then(value_as_u64)
    }

    pub(crate) fn min_sdk_version(&self) -> Option<u32> {
        self.min_sdk_version
            .as_ref()
            .and_then(value_as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
