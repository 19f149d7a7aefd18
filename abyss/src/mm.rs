//! Host memory management.
//!
//! Anonymous page allocations, protection-key syscalls and a snapshot of the
//! process address map.

use crate::addressing::{Va, PAGE_SIZE};
use std::io;

/// Page protection as understood by `mprotect(2)`.
pub mod prot {
    pub const NONE: i32 = libc::PROT_NONE;
    pub const READ: i32 = libc::PROT_READ;
    pub const WRITE: i32 = libc::PROT_WRITE;
    pub const EXEC: i32 = libc::PROT_EXEC;
}

/// An anonymous, page aligned, zero filled mapping that is unmapped on drop.
pub struct Pages {
    va: Va,
    len: usize,
}

unsafe impl Send for Pages {}
unsafe impl Sync for Pages {}

impl Pages {
    /// Map `count` read/write pages.
    pub fn new(count: usize) -> io::Result<Self> {
        let len = count * PAGE_SIZE;
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let va = Va::new(ptr as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a non-canonical address"))?;
        Ok(Self { va, len })
    }

    /// Start address.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages.
    #[inline]
    pub fn count(&self) -> usize {
        self.len / PAGE_SIZE
    }

    /// Raw pointer to page `idx`.
    #[inline]
    pub fn page_ptr(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.count());
        (self.va.into_usize() + idx * PAGE_SIZE) as *mut u8
    }

    /// Whole mapping as bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.va.into_usize() as *mut u8, self.len) }
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.va.into_usize() as *mut libc::c_void, self.len);
        }
    }
}

/// Change the protection of `[addr, addr + len)`.
///
/// # Safety
/// Removing access from memory that live references point to is undefined
/// behavior for the rest of the program.
pub unsafe fn mprotect(addr: Va, len: usize, prot: i32) -> io::Result<()> {
    if libc::mprotect(addr.into_usize() as *mut libc::c_void, len, prot) < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Allocate a protection key with no initial access restriction.
pub fn pkey_alloc() -> io::Result<u32> {
    let ret = unsafe { libc::syscall(libc::SYS_pkey_alloc, 0u64, 0u64) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as u32)
    }
}

/// Release a protection key.
pub fn pkey_free(key: u32) -> io::Result<()> {
    let ret = unsafe { libc::syscall(libc::SYS_pkey_free, key as u64) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Change the protection of `[addr, addr + len)` and tag it with `key`.
///
/// # Safety
/// Same as [`mprotect`].
pub unsafe fn pkey_mprotect(addr: Va, len: usize, prot: i32, key: u32) -> io::Result<()> {
    let ret = libc::syscall(
        libc::SYS_pkey_mprotect,
        addr.into_usize() as u64,
        len as u64,
        prot as u64,
        key as u64,
    );
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// One line of `/proc/self/maps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
    pub offset: u64,
    pub path: Option<String>,
}

impl MapEntry {
    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Kernel managed areas (`[vsyscall]`, `[vvar]`, `[vdso]`) that cannot be
    /// remapped or placed into a guest.
    pub fn is_special(&self) -> bool {
        matches!(
            self.path.as_deref(),
            Some("[vsyscall]") | Some("[vvar]") | Some("[vdso]") | Some("[vvar_vclock]")
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let perms = fields.next()?.as_bytes();
        let offset = fields.next()?;
        let _dev = fields.next()?;
        let _inode = fields.next()?;
        let path = fields.collect::<Vec<_>>().join(" ");
        if perms.len() < 4 {
            return None;
        }
        Some(Self {
            start: usize::from_str_radix(start, 16).ok()?,
            end: usize::from_str_radix(end, 16).ok()?,
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            exec: perms[2] == b'x',
            shared: perms[3] == b's',
            offset: u64::from_str_radix(offset, 16).ok()?,
            path: if path.is_empty() { None } else { Some(path) },
        })
    }
}

/// Snapshot of the process address map.
#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    pub entries: Vec<MapEntry>,
}

impl MemoryMap {
    /// Read `/proc/self/maps`.
    pub fn current() -> io::Result<Self> {
        let text = std::fs::read_to_string("/proc/self/maps")?;
        Self::parse(&text)
    }

    /// Parse the text format of `/proc/<pid>/maps`.
    pub fn parse(text: &str) -> io::Result<Self> {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                MapEntry::parse(l).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("malformed map line: {}", l))
                })
            })
            .collect::<io::Result<Vec<_>>>()
            .map(|entries| Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 fd:01 1311 /usr/bin/cat
55d0c0a02000-55d0c0a07000 r-xp 00002000 fd:01 1311 /usr/bin/cat
55d0c1b5e000-55d0c1b7f000 rw-p 00000000 00:00 0 [heap]
7ffd5d5b4000-7ffd5d5d5000 rw-p 00000000 00:00 0 [stack]
7ffd5d5f9000-7ffd5d5fb000 r-xp 00000000 00:00 0 [vdso]
";

    #[test]
    fn parse_maps() {
        let map = MemoryMap::parse(MAPS).unwrap();
        assert_eq!(map.entries.len(), 5);
        let text = &map.entries[1];
        assert!(text.read && text.exec && !text.write);
        assert_eq!(text.offset, 0x2000);
        assert_eq!(text.size(), 0x5000);
        assert_eq!(map.entries[2].path.as_deref(), Some("[heap]"));
        assert!(map.entries[4].is_special());
        assert!(MemoryMap::parse("garbage").is_err());
    }

    #[test]
    fn pages_are_zeroed() {
        let mut pages = Pages::new(2).unwrap();
        assert_eq!(pages.count(), 2);
        assert!(pages.va().is_aligned());
        assert!(pages.as_mut_slice().iter().all(|b| *b == 0));
    }
}
