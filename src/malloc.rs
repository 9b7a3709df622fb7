//! Pooled memory allocator.
//!
//! Freed blocks do not return to their free list immediately: the caller
//! parks them on its thread state's release chain behind the stream/task
//! that may still touch them, and hands them back through [`Allocator::reclaim`]
//! once that work has drained. Allocation first consults the matching pool,
//! then falls through to the platform allocator.

use std::alloc::Layout;
use std::collections::HashMap;

use crate::errors::{fatal, Error, Result};
use crate::log::{jitlog, LogLevel};

pub const ALLOC_TYPE_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AllocType {
    Host = 0,
    HostAsync,
    HostPinned,
    Device,
    Managed,
}

impl AllocType {
    pub fn name(self) -> &'static str {
        match self {
            AllocType::Host => "host",
            AllocType::HostAsync => "host-async",
            AllocType::HostPinned => "host-pinned",
            AllocType::Device => "device",
            AllocType::Managed => "managed",
        }
    }

    /// Host-side kinds are served from the process heap; device kinds need
    /// a GPU dispatcher.
    pub fn is_host(self) -> bool {
        matches!(
            self,
            AllocType::Host | AllocType::HostAsync | AllocType::HostPinned
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub kind: AllocType,
    pub device: i32,
    /// Rounded size actually backing the block.
    pub size: usize,
}

const ALIGNMENT: usize = 64;

/// Round a request up to its size class. Small blocks share one class so the
/// pools stay compact; everything else rounds to the next power of two.
pub fn size_class(size: usize) -> usize {
    if size <= ALIGNMENT {
        ALIGNMENT
    } else {
        size.next_power_of_two()
    }
}

type PoolKey = (AllocType, i32, usize);

#[derive(Default)]
pub struct Allocator {
    pools: HashMap<PoolKey, Vec<usize>>,
    used: HashMap<usize, Allocation>,
    bytes_used: [usize; ALLOC_TYPE_COUNT],
    bytes_peak: [usize; ALLOC_TYPE_COUNT],
    bytes_pooled: [usize; ALLOC_TYPE_COUNT],
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `size` bytes of `kind` memory on `device` (-1 for host).
    /// `raw_alloc` performs the platform allocation on pool miss; for device
    /// kinds the caller wires it to the GPU dispatcher.
    pub fn malloc(
        &mut self,
        kind: AllocType,
        device: i32,
        size: usize,
        raw_alloc: &mut dyn FnMut(usize) -> Option<usize>,
    ) -> Result<usize> {
        if size == 0 {
            return Err(Error::invalid("malloc(): zero-sized allocation"));
        }
        let class = size_class(size);
        let key = (kind, device, class);

        let ptr = if let Some(ptr) = self.pools.get_mut(&key).and_then(Vec::pop) {
            self.bytes_pooled[kind as usize] -= class;
            ptr
        } else if kind.is_host() {
            host_alloc(class)?
        } else {
            raw_alloc(class).ok_or(Error::OutOfMemory {
                kind: kind.name(),
                size: class,
            })?
        };

        self.used.insert(
            ptr,
            Allocation {
                kind,
                device,
                size: class,
            },
        );
        self.bytes_used[kind as usize] += class;
        self.bytes_peak[kind as usize] =
            self.bytes_peak[kind as usize].max(self.bytes_used[kind as usize]);
        jitlog!(
            LogLevel::Trace,
            "malloc({}, {size} -> class {class}): {ptr:#x}",
            kind.name()
        );
        Ok(ptr)
    }

    pub fn lookup(&self, ptr: usize) -> Option<Allocation> {
        self.used.get(&ptr).copied()
    }

    /// Begin releasing a block. The block leaves the used set but must be
    /// handed to [`reclaim`] (after its stream/task event completes) before
    /// it becomes allocatable again. Double frees are fatal.
    pub fn release(&mut self, ptr: usize) -> Allocation {
        match self.used.remove(&ptr) {
            Some(alloc) => {
                self.bytes_used[alloc.kind as usize] -= alloc.size;
                jitlog!(LogLevel::Trace, "free({:#x}, {})", ptr, alloc.kind.name());
                alloc
            }
            None => fatal(&format!("free({ptr:#x}): double free or unknown pointer")),
        }
    }

    /// Return a released block to its free list.
    pub fn reclaim(&mut self, ptr: usize, alloc: Allocation) {
        self.bytes_pooled[alloc.kind as usize] += alloc.size;
        self.pools
            .entry((alloc.kind, alloc.device, alloc.size))
            .or_default()
            .push(ptr);
    }

    /// Drain every pool, returning backing memory to the platform.
    /// `raw_free` releases device blocks.
    pub fn trim(&mut self, raw_free: &mut dyn FnMut(usize, &Allocation)) {
        let mut freed_blocks = 0usize;
        let mut freed_bytes = 0usize;
        for ((kind, device, class), list) in self.pools.drain() {
            for ptr in list {
                freed_blocks += 1;
                freed_bytes += class;
                if kind.is_host() {
                    host_free(ptr, class);
                } else {
                    raw_free(
                        ptr,
                        &Allocation {
                            kind,
                            device,
                            size: class,
                        },
                    );
                }
            }
        }
        self.bytes_pooled = [0; ALLOC_TYPE_COUNT];
        if freed_blocks > 0 {
            jitlog!(
                LogLevel::Debug,
                "malloc_trim(): freed {freed_blocks} blocks ({freed_bytes} bytes)"
            );
        }
    }

    /// Shutdown-time teardown: trim pools and report still-used blocks.
    pub fn shutdown(&mut self, raw_free: &mut dyn FnMut(usize, &Allocation)) {
        self.trim(raw_free);
        if !self.used.is_empty() {
            jitlog!(
                LogLevel::Warn,
                "shutdown(): {} memory allocations were never freed",
                self.used.len()
            );
        }
        self.used.clear();
        self.bytes_used = [0; ALLOC_TYPE_COUNT];
    }

    pub fn bytes_used(&self, kind: AllocType) -> usize {
        self.bytes_used[kind as usize]
    }

    pub fn bytes_pooled(&self, kind: AllocType) -> usize {
        self.bytes_pooled[kind as usize]
    }

    pub fn peak(&self, kind: AllocType) -> usize {
        self.bytes_peak[kind as usize]
    }

    pub fn used_len(&self) -> usize {
        self.used.len()
    }
}

fn host_alloc(class: usize) -> Result<usize> {
    let layout =
        Layout::from_size_align(class, ALIGNMENT).map_err(|e| Error::invalid(e.to_string()))?;
    // SAFETY: layout has non-zero size and valid alignment.
    let ptr = unsafe { std::alloc::alloc(layout) };
    if ptr.is_null() {
        return Err(Error::OutOfMemory {
            kind: "host",
            size: class,
        });
    }
    Ok(ptr as usize)
}

fn host_free(ptr: usize, class: usize) {
    let layout = Layout::from_size_align(class, ALIGNMENT).expect("valid pool layout");
    // SAFETY: every host pool entry was produced by host_alloc with the
    // identical (class, alignment) layout.
    unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_device(_: usize) -> Option<usize> {
        None
    }

    #[test]
    fn pool_reuses_released_blocks() {
        let mut a = Allocator::new();
        let p1 = a.malloc(AllocType::HostAsync, -1, 1000, &mut no_device).unwrap();
        let alloc = a.release(p1);
        assert_eq!(alloc.size, 1024);
        a.reclaim(p1, alloc);

        // Same size class comes back out of the pool.
        let p2 = a.malloc(AllocType::HostAsync, -1, 700, &mut no_device).unwrap();
        assert_eq!(p1, p2);

        let alloc = a.release(p2);
        a.reclaim(p2, alloc);
        a.trim(&mut |_, _| {});
        assert_eq!(a.bytes_pooled(AllocType::HostAsync), 0);
    }

    #[test]
    fn device_allocation_without_dispatcher_is_oom() {
        let mut a = Allocator::new();
        let r = a.malloc(AllocType::Device, 0, 64, &mut no_device);
        assert!(matches!(r, Err(Error::OutOfMemory { .. })));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut a = Allocator::new();
        let p = a.malloc(AllocType::Host, -1, 64, &mut no_device).unwrap();
        let alloc = a.release(p);
        a.reclaim(p, alloc);
        let _ = a.release(p);
    }

    #[test]
    fn accounting_tracks_watermarks() {
        let mut a = Allocator::new();
        let p1 = a.malloc(AllocType::Host, -1, 128, &mut no_device).unwrap();
        let p2 = a.malloc(AllocType::Host, -1, 128, &mut no_device).unwrap();
        assert_eq!(a.bytes_used(AllocType::Host), 256);
        assert_eq!(a.peak(AllocType::Host), 256);
        let alloc = a.release(p1);
        a.reclaim(p1, alloc);
        assert_eq!(a.bytes_used(AllocType::Host), 128);
        assert_eq!(a.peak(AllocType::Host), 256);
        let alloc = a.release(p2);
        a.reclaim(p2, alloc);
        a.trim(&mut |_, _| {});
    }
}
