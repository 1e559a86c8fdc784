//! Bounded reads from bulk ZIP archives.
//!
//! Every product ships as a ZIP. Members are read with a size cap so a
//! corrupt or hostile archive cannot exhaust memory, and nested archives
//! (accounts bundles) are opened from memory.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;

use zip::ZipArchive;

use crate::error::{IngestError, IngestResult};
use crate::models::RawDocument;

/// Largest single member read into memory.
pub const MAX_MEMBER_BYTES: u64 = 256 * 1024 * 1024;

/// How deep nested archives are followed.
pub const MAX_NESTING: usize = 2;

pub fn open(path: &Path) -> IngestResult<ZipArchive<BufReader<File>>> {
    let file = File::open(path)?;
    ZipArchive::new(BufReader::new(file))
        .map_err(|e| IngestError::malformed(path.display().to_string(), e))
}

pub fn open_nested(doc: RawDocument) -> IngestResult<ZipArchive<Cursor<Vec<u8>>>> {
    let name = doc.filename;
    ZipArchive::new(Cursor::new(doc.bytes)).map_err(|e| IngestError::malformed(name, e))
}

/// Name of member `index`, or `None` for directories.
pub fn member_name<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
) -> IngestResult<Option<String>> {
    let entry = archive
        .by_index(index)
        .map_err(|e| IngestError::malformed(format!("member {}", index), e))?;
    if entry.is_dir() {
        return Ok(None);
    }
    Ok(Some(entry.name().to_string()))
}

/// Read member `index` fully, refusing members over `max_bytes`.
pub fn read_member_bounded<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
    max_bytes: u64,
) -> IngestResult<RawDocument> {
    let entry = archive
        .by_index(index)
        .map_err(|e| IngestError::malformed(format!("member {}", index), e))?;
    let name = entry.name().to_string();
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| IngestError::malformed(name.clone(), e))?;
    if out.len() as u64 >= max_bytes {
        return Err(IngestError::malformed(
            name,
            format!("member exceeds size limit ({} bytes)", max_bytes),
        ));
    }
    Ok(RawDocument::new(name, out))
}

/// Index of the first member whose extension is one of `extensions`,
/// falling back to the first file member.
pub fn find_member<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    extensions: &[&str],
) -> IngestResult<Option<usize>> {
    let mut first_file = None;
    for i in 0..archive.len() {
        let Some(name) = member_name(archive, i)? else {
            continue;
        };
        let lower = name.to_ascii_lowercase();
        if extensions.iter().any(|ext| lower.ends_with(&format!(".{}", ext))) {
            return Ok(Some(i));
        }
        first_file.get_or_insert(i);
    }
    Ok(first_file)
}

/// Last path segment of a member name.
pub fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}
