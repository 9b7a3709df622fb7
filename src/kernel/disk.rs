//! On-disk kernel cache (L2).
//!
//! One file per fingerprint under the cache directory, written to a
//! temporary name and atomically renamed so concurrent processes never
//! observe a torn file. Layout:
//!
//! ```text
//! magic (6)  | format version (u32) | uncompressed size (u64)
//! compressed size (u64) | backend tag (u8) | metadata length (u32)
//! metadata blob | LZ4 block payload
//! ```
//!
//! The metadata blob is backend-specific: relocation/entry offsets for
//! native images, a NUL-separated entry-name table for CUDA modules, empty
//! for portable programs.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::BaseDirs;

use crate::errors::{Error, Result};
use crate::log::{jitlog, LogLevel};

use super::Fingerprint;

pub const MAGIC: &[u8; 6] = b"arjit\0";
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 6 + 4 + 8 + 8 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendTag {
    Native = 0,
    Cuda = 1,
    Portable = 2,
}

impl BackendTag {
    fn from_u8(raw: u8) -> Option<BackendTag> {
        match raw {
            0 => Some(BackendTag::Native),
            1 => Some(BackendTag::Cuda),
            2 => Some(BackendTag::Portable),
            _ => None,
        }
    }
}

/// A kernel artifact as stored on disk.
pub struct DiskKernel {
    pub backend: BackendTag,
    pub metadata: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Cache directory: `$ARRAYJIT_CACHE_DIR`, else `<home>/.arrayjit`.
pub fn cache_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("ARRAYJIT_CACHE_DIR") {
        if !custom.is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }
    let base = BaseDirs::new()
        .ok_or_else(|| Error::invalid("could not determine the user home directory"))?;
    Ok(base.home_dir().join(".arrayjit"))
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

fn kernel_path(dir: &Path, fingerprint: Fingerprint) -> PathBuf {
    dir.join(fingerprint.to_hex())
}

pub fn write(
    dir: &Path,
    fingerprint: Fingerprint,
    backend: BackendTag,
    metadata: &[u8],
    payload: &[u8],
) -> Result<()> {
    let compressed = lz4_flex::compress(payload);

    let mut body = Vec::with_capacity(HEADER_LEN + metadata.len() + compressed.len());
    body.extend_from_slice(MAGIC);
    body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    body.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    body.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    body.push(backend as u8);
    body.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    body.extend_from_slice(metadata);
    body.extend_from_slice(&compressed);

    let path = kernel_path(dir, fingerprint);
    let tmp = dir.join(format!(
        ".{}.{}.tmp",
        fingerprint.to_hex(),
        std::process::id()
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    match fs::rename(&tmp, &path) {
        Ok(()) => {
            jitlog!(
                LogLevel::Debug,
                "cache: wrote {} ({} -> {} bytes)",
                fingerprint,
                payload.len(),
                compressed.len()
            );
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e.into())
        }
    }
}

/// Read one cached kernel. `Ok(None)` means absent; malformed files are
/// reported as absent as well (and removed), since the cache is advisory.
pub fn read(dir: &Path, fingerprint: Fingerprint) -> Result<Option<DiskKernel>> {
    let path = kernel_path(dir, fingerprint);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match parse(&data) {
        Some(kernel) => Ok(Some(kernel)),
        None => {
            jitlog!(
                LogLevel::Warn,
                "cache: discarding malformed or outdated entry {fingerprint}"
            );
            let _ = fs::remove_file(&path);
            Ok(None)
        }
    }
}

fn parse(data: &[u8]) -> Option<DiskKernel> {
    if data.len() < HEADER_LEN || &data[..6] != MAGIC {
        return None;
    }
    let version = u32::from_le_bytes(data[6..10].try_into().ok()?);
    if version != FORMAT_VERSION {
        return None;
    }
    let uncompressed = u64::from_le_bytes(data[10..18].try_into().ok()?) as usize;
    let compressed = u64::from_le_bytes(data[18..26].try_into().ok()?) as usize;
    let backend = BackendTag::from_u8(data[26])?;
    let meta_len = u32::from_le_bytes(data[27..31].try_into().ok()?) as usize;

    let meta_start = HEADER_LEN;
    let payload_start = meta_start.checked_add(meta_len)?;
    let end = payload_start.checked_add(compressed)?;
    if end != data.len() {
        return None;
    }

    let metadata = data[meta_start..payload_start].to_vec();
    let payload = lz4_flex::decompress(&data[payload_start..end], uncompressed).ok()?;
    if payload.len() != uncompressed {
        return None;
    }

    Some(DiskKernel {
        backend,
        metadata,
        payload,
    })
}

/// Encode the native-image metadata blob (entry + relocation offsets).
pub fn encode_native_metadata(entries: &[usize], reloc: &[usize]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + (entries.len() + reloc.len()) * 8);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for &e in entries {
        out.extend_from_slice(&(e as u64).to_le_bytes());
    }
    out.extend_from_slice(&(reloc.len() as u32).to_le_bytes());
    for &r in reloc {
        out.extend_from_slice(&(r as u64).to_le_bytes());
    }
    out
}

pub fn decode_native_metadata(data: &[u8]) -> Option<(Vec<usize>, Vec<usize>)> {
    let mut pos = 0usize;
    let mut read_list = |data: &[u8]| -> Option<Vec<usize>> {
        let n = u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?) as usize;
        pos += 4;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(u64::from_le_bytes(data.get(pos..pos + 8)?.try_into().ok()?) as usize);
            pos += 8;
        }
        Some(out)
    };
    let entries = read_list(data)?;
    let reloc = read_list(data)?;
    if pos != data.len() {
        return None;
    }
    Some((entries, reloc))
}

/// Encode the CUDA entry-name table (NUL-terminated names).
pub fn encode_entry_names(names: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    out
}

pub fn decode_entry_names(data: &[u8]) -> Option<Vec<String>> {
    if !data.is_empty() && data.last() != Some(&0) {
        return None;
    }
    data.split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8(chunk.to_vec()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fp = Fingerprint::of(b"disk kernel");
        let payload = vec![7u8; 4096];
        let metadata = encode_native_metadata(&[0, 128], &[0, 64]);

        write(dir.path(), fp, BackendTag::Native, &metadata, &payload).unwrap();
        let loaded = read(dir.path(), fp).unwrap().expect("entry present");

        assert_eq!(loaded.backend, BackendTag::Native);
        assert_eq!(loaded.payload, payload);
        let (entries, reloc) = decode_native_metadata(&loaded.metadata).unwrap();
        assert_eq!(entries, vec![0, 128]);
        assert_eq!(reloc, vec![0, 64]);
    }

    #[test]
    fn absent_entry_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(dir.path(), Fingerprint::of(b"missing")).unwrap().is_none());
    }

    #[test]
    fn corrupt_entry_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let fp = Fingerprint::of(b"corrupt");
        write(dir.path(), fp, BackendTag::Portable, &[], b"payload").unwrap();

        let path = dir.path().join(fp.to_hex());
        let mut data = fs::read(&path).unwrap();
        data.truncate(data.len() - 2);
        fs::write(&path, &data).unwrap();

        assert!(read(dir.path(), fp).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn entry_name_table_round_trips() {
        let names = vec!["kern_0".to_string(), "kern_1_callable".to_string()];
        let blob = encode_entry_names(&names);
        assert_eq!(decode_entry_names(&blob).unwrap(), names);
        assert_eq!(decode_entry_names(&[]).unwrap(), Vec::<String>::new());
        assert!(decode_entry_names(b"unterminated").is_none());
    }
}
