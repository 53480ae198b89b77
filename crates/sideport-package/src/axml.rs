//! Minimal reader for the compiled (binary XML) `AndroidManifest.xml` inside an
//! APK. Only the `<manifest>` and `<uses-sdk>` attributes needed to describe a
//! package are decoded; everything else is skipped chunk by chunk.

use thiserror::Error;

const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_TYPE: u16 = 0x0003;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;

const UTF8_FLAG: u32 = 1 << 8;
const NO_INDEX: u32 = 0xFFFF_FFFF;

const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;

// android.R.attr ids, used when attribute names were stripped by an obfuscator.
const ATTR_VERSION_CODE: u32 = 0x0101_021b;
const ATTR_VERSION_NAME: u32 = 0x0101_021c;
const ATTR_MIN_SDK_VERSION: u32 = 0x0101_020c;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AxmlError {
    #[error("not a binary XML document")]
    NotBinaryXml,
    #[error("binary XML truncated at offset {0}")]
    Truncated(usize),
    #[error("malformed chunk at offset {0}")]
    BadChunk(usize),
    #[error("string index {0} out of range")]
    BadStringIndex(u32),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestInfo {
    pub package: Option<String>,
    pub version_code: Option<u64>,
    pub version_name: Option<String>,
    pub min_sdk_version: Option<u32>,
}

enum AttrValue {
    Str(String),
    Int(u32),
    Other,
}

fn u16_at(data: &[u8], off: usize) -> Result<u16, AxmlError> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(AxmlError::Truncated(off))
}

fn u32_at(data: &[u8], off: usize) -> Result<u32, AxmlError> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(AxmlError::Truncated(off))
}

fn u8_at(data: &[u8], off: usize) -> Result<u8, AxmlError> {
    data.get(off).copied().ok_or(AxmlError::Truncated(off))
}

pub fn parse_manifest(data: &[u8]) -> Result<ManifestInfo, AxmlError> {
    if u16_at(data, 0).map_err(|_| AxmlError::NotBinaryXml)? != RES_XML_TYPE {
        return Err(AxmlError::NotBinaryXml);
    }
    let mut pos = u16_at(data, 2)? as usize;
    let end = (u32_at(data, 4)? as usize).min(data.len());

    let mut strings: Vec<String> = Vec::new();
    let mut resource_ids: Vec<u32> = Vec::new();
    let mut info = ManifestInfo::default();
    let mut seen_manifest = false;

    while pos + 8 <= end {
        let chunk_type = u16_at(data, pos)?;
        let header_size = u16_at(data, pos + 2)? as usize;
        let size = u32_at(data, pos + 4)? as usize;
        if size < 8 || header_size < 8 || pos + size > end {
            return Err(AxmlError::BadChunk(pos));
        }

        match chunk_type {
            RES_STRING_POOL_TYPE => strings = read_string_pool(data, pos)?,
            RES_XML_RESOURCE_MAP_TYPE => {
                resource_ids = (pos + header_size..pos + size)
                    .step_by(4)
                    .map(|off| u32_at(data, off))
                    .collect::<Result<_, _>>()?;
            }
            RES_XML_START_ELEMENT_TYPE => {
                let ext = pos + header_size;
                let name = lookup(&strings, u32_at(data, ext + 4)?)?;
                match name {
                    "manifest" => {
                        seen_manifest = true;
                        for (attr, value) in read_attributes(data, ext, &strings, &resource_ids)? {
                            match (attr.as_str(), value) {
                                ("package", AttrValue::Str(v)) => info.package = Some(v),
                                ("versionCode", AttrValue::Int(v)) => {
                                    info.version_code = Some(u64::from(v))
                                }
                                ("versionCode", AttrValue::Str(v)) => {
                                    info.version_code = v.trim().parse().ok()
                                }
                                ("versionName", AttrValue::Str(v)) => info.version_name = Some(v),
                                _ => {}
                            }
                        }
                    }
                    "uses-sdk" => {
                        for (attr, value) in read_attributes(data, ext, &strings, &resource_ids)? {
                            match (attr.as_str(), value) {
                                ("minSdkVersion", AttrValue::Int(v)) => {
                                    info.min_sdk_version = Some(v)
                                }
                                ("minSdkVersion", AttrValue::Str(v)) => {
                                    info.min_sdk_version = v.trim().parse().ok()
                                }
                                _ => {}
                            }
                        }
                        break;
                    }
                    // uses-sdk precedes <application>; nothing useful after it.
                    "application" => break,
                    _ => {}
                }
            }
            _ => {}
        }
        pos += size;
    }

    if !seen_manifest {
        return Err(AxmlError::NotBinaryXml);
    }
    Ok(info)
}

fn lookup(strings: &[String], index: u32) -> Result<&str, AxmlError> {
    strings
        .get(index as usize)
        .map(String::as_str)
        .ok_or(AxmlError::BadStringIndex(index))
}

fn read_attributes(
    data: &[u8],
    ext: usize,
    strings: &[String],
    resource_ids: &[u32],
) -> Result<Vec<(String, AttrValue)>, AxmlError> {
    let attr_start = u16_at(data, ext + 8)? as usize;
    let attr_size = u16_at(data, ext + 10)? as usize;
    let attr_count = u16_at(data, ext + 12)? as usize;
    if attr_size < 20 {
        return Err(AxmlError::BadChunk(ext));
    }

    let mut attrs = Vec::with_capacity(attr_count);
    for i in 0..attr_count {
        let at = ext + attr_start + i * attr_size;
        let name_index = u32_at(data, at + 4)?;
        let raw = u32_at(data, at + 8)?;
        let data_type = u8_at(data, at + 15)?;
        let value = u32_at(data, at + 16)?;

        let mut name = lookup(strings, name_index)?.to_string();
        if name.is_empty() {
            name = match resource_ids.get(name_index as usize) {
                Some(&ATTR_VERSION_CODE) => "versionCode".into(),
                Some(&ATTR_VERSION_NAME) => "versionName".into(),
                Some(&ATTR_MIN_SDK_VERSION) => "minSdkVersion".into(),
                _ => continue,
            };
        }

        let value = if raw != NO_INDEX {
            AttrValue::Str(lookup(strings, raw)?.to_string())
        } else {
            match data_type {
                TYPE_STRING => AttrValue::Str(lookup(strings, value)?.to_string()),
                TYPE_INT_DEC | TYPE_INT_HEX => AttrValue::Int(value),
                _ => AttrValue::Other,
            }
        };
        attrs.push((name, value));
    }
    Ok(attrs)
}

fn read_string_pool(data: &[u8], start: usize) -> Result<Vec<String>, AxmlError> {
    let header_size = u16_at(data, start + 2)? as usize;
    let count = u32_at(data, start + 8)? as usize;
    let flags = u32_at(data, start + 16)?;
    let strings_start = u32_at(data, start + 20)? as usize;
    let utf8 = flags & UTF8_FLAG != 0;

    let mut out = Vec::with_capacity(count.min(4096));
    for i in 0..count {
        let offset = u32_at(data, start + header_size + i * 4)? as usize;
        let at = start + strings_start + offset;
        out.push(if utf8 {
            decode_utf8(data, at)?
        } else {
            decode_utf16(data, at)?
        });
    }
    Ok(out)
}

fn decode_utf16(data: &[u8], at: usize) -> Result<String, AxmlError> {
    let mut len = u16_at(data, at)? as usize;
    let mut pos = at + 2;
    if len & 0x8000 != 0 {
        len = ((len & 0x7FFF) << 16) | u16_at(data, pos)? as usize;
        pos += 2;
    }
    let bytes = data
        .get(pos..pos + len * 2)
        .ok_or(AxmlError::Truncated(pos))?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

fn decode_utf8(data: &[u8], at: usize) -> Result<String, AxmlError> {
    // UTF-16 length first, then UTF-8 byte length; only the latter matters.
    let (_, pos) = utf8_length(data, at)?;
    let (len, pos) = utf8_length(data, pos)?;
    let bytes = data.get(pos..pos + len).ok_or(AxmlError::Truncated(pos))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn utf8_length(data: &[u8], at: usize) -> Result<(usize, usize), AxmlError> {
    let first = u8_at(data, at)? as usize;
    if first & 0x80 != 0 {
        let second = u8_at(data, at + 1)? as usize;
        Ok((((first & 0x7F) << 8) | second, at + 2))
    } else {
        Ok((first, at + 1))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn push_u16(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn string_pool(strings: &[&str]) -> Vec<u8> {
        let mut offsets = Vec::new();
        let mut body = Vec::new();
        for s in strings {
            offsets.push(body.len() as u32);
            let units: Vec<u16> = s.encode_utf16().collect();
            push_u16(&mut body, units.len() as u16);
            for unit in units {
                push_u16(&mut body, unit);
            }
            push_u16(&mut body, 0);
        }
        while body.len() % 4 != 0 {
            body.push(0);
        }
        let strings_start = 28 + 4 * strings.len();
        let mut out = Vec::new();
        push_u16(&mut out, RES_STRING_POOL_TYPE);
        push_u16(&mut out, 28);
        push_u32(&mut out, (strings_start + body.len()) as u32);
        push_u32(&mut out, strings.len() as u32);
        push_u32(&mut out, 0);
        push_u32(&mut out, 0);
        push_u32(&mut out, strings_start as u32);
        push_u32(&mut out, 0);
        for off in offsets {
            push_u32(&mut out, off);
        }
        out.extend(body);
        out
    }

    // (name index, raw string index, data type, data)
    fn start_element(name: u32, attrs: &[(u32, u32, u8, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        push_u16(&mut out, RES_XML_START_ELEMENT_TYPE);
        push_u16(&mut out, 16);
        push_u32(&mut out, (16 + 20 + 20 * attrs.len()) as u32);
        push_u32(&mut out, 1);
        push_u32(&mut out, NO_INDEX);
        push_u32(&mut out, NO_INDEX);
        push_u32(&mut out, name);
        push_u16(&mut out, 20);
        push_u16(&mut out, 20);
        push_u16(&mut out, attrs.len() as u16);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        for &(attr_name, raw, data_type, data) in attrs {
            push_u32(&mut out, NO_INDEX);
            push_u32(&mut out, attr_name);
            push_u32(&mut out, raw);
            push_u16(&mut out, 8);
            out.push(0);
            out.push(data_type);
            push_u32(&mut out, data);
        }
        out
    }

    /// Compiles a manifest with the given identity the way aapt2 lays it out.
    pub(crate) fn encode_manifest(
        package: &str,
        version_code: u32,
        version_name: &str,
        min_sdk: u32,
    ) -> Vec<u8> {
        let strings = [
            "manifest",
            "package",
            "versionCode",
            "versionName",
            package,
            version_name,
            "uses-sdk",
            "minSdkVersion",
        ];
        let mut body = string_pool(&strings);
        body.extend(start_element(
            0,
            &[
                (1, 4, TYPE_STRING, 4),
                (2, NO_INDEX, TYPE_INT_DEC, version_code),
                (3, 5, TYPE_STRING, 5),
            ],
        ));
        body.extend(start_element(
            6,
            &[(7, NO_INDEX, TYPE_INT_DEC, min_sdk)],
        ));

        let mut out = Vec::new();
        push_u16(&mut out, RES_XML_TYPE);
        push_u16(&mut out, 8);
        push_u32(&mut out, (8 + body.len()) as u32);
        out.extend(body);
        out
    }

    #[test]
    fn reads_identity_from_compiled_manifest() {
        let data = encode_manifest("com.example.game", 1207, "3.1.4", 24);
        let info = parse_manifest(&data).unwrap();
        assert_eq!(info.package.as_deref(), Some("com.example.game"));
        assert_eq!(info.version_code, Some(1207));
        assert_eq!(info.version_name.as_deref(), Some("3.1.4"));
        assert_eq!(info.min_sdk_version, Some(24));
    }

    #[test]
    fn plain_text_xml_is_rejected() {
        let err = parse_manifest(b"<?xml version=\"1.0\"?><manifest/>").unwrap_err();
        assert_eq!(err, AxmlError::NotBinaryXml);
    }

    #[test]
    fn truncated_document_is_an_error_not_a_panic() {
        let data = encode_manifest("com.example.game", 1, "1", 21);
        for cut in [3, 10, 40, data.len() / 2, data.len() - 3] {
            assert!(parse_manifest(&data[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn utf8_pool_strings_decode() {
        let mut data = vec![0u8; 0];
        data.extend_from_slice(&[3, 3]);
        data.extend_from_slice(b"abc");
        assert_eq!(decode_utf8(&data, 0).unwrap(), "abc");
    }
}
