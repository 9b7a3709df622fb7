//! Compiled kernels and their identity.

pub mod cache;
pub mod disk;
pub mod program;

use std::fmt;
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::errors::{Error, Result};

pub use cache::KernelCache;
pub use program::Program;

/// 128-bit content hash identifying a kernel (truncated SHA-1 of the
/// serialized group description).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Fingerprint(out)
    }

    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Native machine code relocated into an executable mapping.
pub struct NativeImage {
    map: memmap2::Mmap,
    /// Entry points as offsets into the mapping; entry 0 is the kernel body,
    /// the rest are callables.
    pub entries: Vec<usize>,
    /// Relocation slots (offsets). When more than one slot exists, slot 1
    /// holds the callables table base and is patched before the map turns
    /// executable.
    pub reloc: Vec<usize>,
    /// Absolute addresses of the callable entries; relocation slot 1 points
    /// at this table. Kept alive for the kernel's lifetime.
    callables: Box<[u64]>,
}

// Mapping is read/execute-only after construction.
unsafe impl Sync for NativeImage {}

impl NativeImage {
    /// Copy `bytes` into a fresh anonymous mapping, patch the callables
    /// table base into relocation slot 1, and flip the pages to RX.
    pub fn new(bytes: &[u8], entries: Vec<usize>, reloc: Vec<usize>) -> Result<NativeImage> {
        if entries.is_empty() || entries.iter().chain(&reloc).any(|&o| o >= bytes.len()) {
            return Err(Error::invalid("native image: offset out of bounds"));
        }
        let mut map = memmap2::MmapMut::map_anon(bytes.len())?;
        map.copy_from_slice(bytes);

        let base = map.as_ptr() as usize;
        let callables: Box<[u64]> = entries[1..]
            .iter()
            .map(|&off| (base + off) as u64)
            .collect();

        if reloc.len() > 1 {
            if reloc[1] + 8 > bytes.len() {
                return Err(Error::invalid("native image: relocation slot out of bounds"));
            }
            let slot = reloc[1];
            map[slot..slot + 8].copy_from_slice(&(callables.as_ptr() as u64).to_le_bytes());
        }

        let map = map.make_exec()?;
        Ok(NativeImage {
            map,
            entries,
            reloc,
            callables,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn entry_ptr(&self, index: usize) -> usize {
        self.map.as_ptr() as usize + self.entries[index]
    }

    pub fn callable_table(&self) -> &[u64] {
        &self.callables
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }
}

/// CUDA kernel: retained PTX plus per-device module handles. The PTX is
/// loaded lazily on each device it runs on, so a `cuda_set_device` after a
/// cache hit only re-loads the module, never recompiles the source.
pub struct CudaImage {
    pub entry_names: Vec<String>,
    pub ptx: Arc<str>,
    /// device id -> (module handle, function handles per entry).
    pub modules: parking_lot::Mutex<std::collections::HashMap<i32, (usize, Vec<usize>)>>,
}

impl CudaImage {
    pub fn new(entry_names: Vec<String>, ptx: Arc<str>) -> CudaImage {
        CudaImage {
            entry_names,
            ptx,
            modules: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

pub enum KernelImage {
    Native(NativeImage),
    Cuda(CudaImage),
    Portable(Arc<Program>),
}

pub struct Kernel {
    pub fingerprint: Fingerprint,
    pub image: KernelImage,
    /// Size of the compiled artifact in bytes (machine code, PTX text, or
    /// serialized program).
    pub size: usize,
}

impl Kernel {
    pub fn backend_tag(&self) -> disk::BackendTag {
        match self.image {
            KernelImage::Native(_) => disk::BackendTag::Native,
            KernelImage::Cuda(_) => disk::BackendTag::Cuda,
            KernelImage::Portable(_) => disk::BackendTag::Portable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = Fingerprint::of(b"kernel body");
        let b = Fingerprint::of(b"kernel body");
        let c = Fingerprint::of(b"kernel bodz");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), 32);
    }

    #[test]
    fn native_image_round_trips_bytes() {
        // A handful of x86 ret instructions; never executed by the test.
        let bytes = vec![0xc3u8; 64];
        let image = NativeImage::new(&bytes, vec![0], vec![0]).unwrap();
        assert_eq!(image.len(), 64);
        assert_eq!(image.bytes()[0], 0xc3);
        assert_eq!(image.entry_ptr(0) % 2, image.map.as_ptr() as usize % 2);
    }

    #[test]
    fn native_image_rejects_bad_offsets() {
        assert!(NativeImage::new(&[0xc3; 8], vec![64], vec![]).is_err());
        assert!(NativeImage::new(&[0xc3; 8], vec![], vec![]).is_err());
    }
}
