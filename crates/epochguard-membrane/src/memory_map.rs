//! Working/backup region pairs.
//!
//! A [`MemoryMap`] owns a private anonymous mapping the same size as the
//! region it protects. `backup` copies the working bytes out, `commit`
//! refreshes a sub-range, `recover_memory` copies them back. One map exists
//! for the heap and one per writable global segment listed in
//! `/proc/self/maps`.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use tracing::debug;

use crate::error::{GuardError, Result};

/// RAII wrapper around an anonymous, private, `MAP_NORESERVE` mapping.
pub struct MappedRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory; synchronisation is the owner's job.
unsafe impl Send for MappedRegion {}
// SAFETY: as above.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn reserve(len: usize) -> Result<Self> {
        let len = len.max(1);
        // SAFETY: anonymous mapping request with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(GuardError::last_os("mmap"));
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| GuardError::last_os("mmap"))?;
        Ok(Self { base, len })
    }

    #[must_use]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: we own the mapping and nobody borrows it past drop.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

pub struct MemoryMap {
    name: String,
    start: usize,
    len: usize,
    backup: MappedRegion,
    /// Bytes copied by the last backup, measured from `start`.
    backed_up: usize,
}

impl MemoryMap {
    /// Protect `[start, start + len)`. The region must stay mapped and
    /// writable for the life of the map.
    pub fn new(name: impl Into<String>, start: usize, len: usize) -> Result<Self> {
        let name = name.into();
        let backup = MappedRegion::reserve(len).map_err(|e| GuardError::MemoryMap {
            name: name.clone(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            name,
            start,
            len,
            backup,
            backed_up: 0,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    fn clamp(&self, cutpoint: Option<usize>) -> usize {
        cutpoint
            .map(|c| c.clamp(self.start, self.end()) - self.start)
            .unwrap_or(self.len)
    }

    /// Copy the working region, or its prefix up to `cutpoint`, into the backup.
    pub fn backup(&mut self, cutpoint: Option<usize>) {
        let len = self.clamp(cutpoint);
        // SAFETY: both ranges are valid for `len` bytes and never overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.start as *const u8, self.backup.as_ptr(), len);
        }
        self.backed_up = len;
        debug!(map = %self.name, bytes = len, "memory backed up");
    }

    /// Refresh the backup for `[addr, addr + size)` only. Output buffers of
    /// recorded calls go through here so they survive a rollback.
    pub fn commit(&mut self, addr: usize, size: usize) {
        let lo = addr.max(self.start);
        let hi = addr.saturating_add(size).min(self.end());
        if lo >= hi {
            return;
        }
        let offset = lo - self.start;
        // SAFETY: [lo, hi) lies inside the working region and the backup.
        unsafe {
            std::ptr::copy_nonoverlapping(
                lo as *const u8,
                self.backup.as_ptr().add(offset),
                hi - lo,
            );
        }
    }

    /// Restore the working region from the last backup. Bytes past the
    /// backed-up prefix, up to `dirty_end`, are zeroed as they were when
    /// first handed out.
    pub fn recover_memory(&self, dirty_end: Option<usize>) {
        // SAFETY: backup and working region are distinct mappings of at
        // least `backed_up` bytes; the zeroed tail lies inside the region.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.backup.as_ptr(),
                self.start as *mut u8,
                self.backed_up,
            );
            let dirty = self.clamp(dirty_end);
            if dirty > self.backed_up {
                std::ptr::write_bytes(
                    (self.start + self.backed_up) as *mut u8,
                    0,
                    dirty - self.backed_up,
                );
            }
        }
        debug!(map = %self.name, bytes = self.backed_up, "memory recovered");
    }

    /// Value of the word at `addr` as of the last backup.
    #[must_use]
    pub fn backed_up_word(&self, addr: usize) -> Option<u64> {
        if addr < self.start || addr + 8 > self.start + self.backed_up {
            return None;
        }
        // SAFETY: bounds checked against the backed-up prefix above.
        Some(unsafe {
            std::ptr::read_unaligned(self.backup.as_ptr().add(addr - self.start).cast::<u64>())
        })
    }
}

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub private: bool,
    pub path: String,
}

impl SegmentInfo {
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[must_use]
pub fn parse_maps_line(line: &str) -> Option<SegmentInfo> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?.as_bytes();
    let (lo, hi) = range.split_once('-')?;
    let start = usize::from_str_radix(lo, 16).ok()?;
    let end = usize::from_str_radix(hi, 16).ok()?;
    if perms.len() < 4 {
        return None;
    }
    // offset, device, inode
    let path = fields.nth(3).unwrap_or("").to_string();
    Some(SegmentInfo {
        start,
        end,
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
        private: perms[3] == b'p',
        path,
    })
}

/// Writable data segments of loaded images, minus the engine's own image
/// and the special kernel/stack/heap areas.
#[must_use]
pub fn discover_global_segments(maps: &str, exclude: &[&str]) -> Vec<SegmentInfo> {
    const SPECIAL: [&str; 5] = ["[heap]", "[stack]", "[vdso]", "[vvar]", "[vsyscall]"];
    maps.lines()
        .filter_map(parse_maps_line)
        .filter(|s| s.readable && s.writable && s.private && !s.is_empty())
        .filter(|s| s.path.starts_with('/'))
        .filter(|s| !SPECIAL.iter().any(|p| s.path.starts_with(p)))
        .filter(|s| !exclude.iter().any(|e| s.path.contains(e)))
        .collect()
}

pub fn read_proc_maps() -> Result<String> {
    std::fs::read_to_string("/proc/self/maps").map_err(|source| GuardError::Os {
        call: "read /proc/self/maps",
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a21000 r-xp 00000000 08:01 1048 /usr/bin/app
55d0c0c21000-55d0c0c22000 rw-p 00021000 08:01 1048 /usr/bin/app
55d0c1000000-55d0c1021000 rw-p 00000000 00:00 0 [heap]
7f0a10000000-7f0a10001000 rw-p 00003000 08:01 2001 /usr/lib/libepochguard_core.so
7f0a20000000-7f0a20004000 rw-p 001ec000 08:01 2002 /usr/lib/x86_64-linux-gnu/libc.so.6
7f0a20004000-7f0a20010000 rw-p 00000000 00:00 0
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0 [stack]
7ffd00100000-7ffd00102000 r-xp 00000000 00:00 0 [vdso]
";

    #[test]
    fn parses_maps_line() {
        let seg = parse_maps_line(MAPS.lines().nth(1).unwrap()).unwrap();
        assert_eq!(seg.start, 0x55d0_c0c2_1000);
        assert_eq!(seg.len(), 0x1000);
        assert!(seg.writable && seg.private);
        assert_eq!(seg.path, "/usr/bin/app");
        assert!(parse_maps_line("garbage").is_none());
    }

    #[test]
    fn global_segments_skip_engine_and_special_areas() {
        let segs = discover_global_segments(MAPS, &["epochguard"]);
        let paths: Vec<_> = segs.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/usr/bin/app", "/usr/lib/x86_64-linux-gnu/libc.so.6"]
        );
    }

    #[test]
    fn backup_commit_recover() {
        let mut working = vec![1u8; 256];
        let start = working.as_mut_ptr() as usize;
        let mut map = MemoryMap::new("test", start, 256).unwrap();
        map.backup(Some(start + 128));

        working[0] = 9;
        working[64] = 7;
        working[200] = 5;
        map.commit(start + 64, 1);
        map.recover_memory(Some(start + 256));

        assert_eq!(working[0], 1);
        assert_eq!(working[64], 7, "committed byte survives recovery");
        assert_eq!(working[200], 0, "bytes past the backup are zeroed");
        assert_eq!(map.backed_up_word(start), Some(u64::from_ne_bytes([1; 8])));
        assert_eq!(map.backed_up_word(start + 200), None);
    }

    #[test]
    fn mapped_region_is_zeroed() {
        let region = MappedRegion::reserve(4096).unwrap();
        assert_eq!(region.len(), 4096);
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
