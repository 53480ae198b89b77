use std::{
    fs::{self, File},
    io::{self, BufReader, Read},
    path::Path,
};

use tracing::debug;
use zip::{result::ZipError, ZipArchive};

use crate::error::ParseError;

pub(crate) type Archive = ZipArchive<BufReader<File>>;

// Manifests are tiny; anything this large is not one.
const MAX_METADATA_ENTRY_BYTES: u64 = 8 * 1024 * 1024;

pub(crate) fn open(path: &Path) -> Result<Archive, ParseError> {
    let file = File::open(path)?;
    Ok(ZipArchive::new(BufReader::new(file))?)
}

/// Reads a small named entry. `Ok(None)` means the entry does not exist.
pub(crate) fn read_entry(archive: &mut Archive, name: &str) -> Result<Option<Vec<u8>>, ParseError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if entry.size() > MAX_METADATA_ENTRY_BYTES {
        return Err(ParseError::ArchiveCorrupt(format!(
            "{name} is {} bytes",
            entry.size()
        )));
    }
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .take(MAX_METADATA_ENTRY_BYTES)
        .read_to_end(&mut buf)
        .map_err(|err| ParseError::ArchiveCorrupt(format!("{name}: {err}")))?;
    Ok(Some(buf))
}

/// Expands every entry under `dest`. Entries whose names would land outside
/// `dest` make the whole archive corrupt.
pub(crate) fn extract_all(archive: &mut Archive, dest: &Path) -> Result<usize, ParseError> {
    fs::create_dir_all(dest)?;
    let mut files = 0usize;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            ParseError::ArchiveCorrupt(format!("entry {:?} escapes the bundle root", entry.name()))
        })?;
        let target = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out).map_err(|err| {
            if err.kind() == io::ErrorKind::InvalidData || err.kind() == io::ErrorKind::UnexpectedEof
            {
                ParseError::ArchiveCorrupt(format!("{}: {err}", relative.display()))
            } else {
                ParseError::Io(err)
            }
        })?;
        files += 1;
    }
    debug!("extracted {files} files into {}", dest.display());
    Ok(files)
}
