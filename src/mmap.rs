// src/mmap.rs
use libc::c_void;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr;
use std::slice;

/// A read-only memory mapping of a regular file.
///
/// Used for zero-copy response bodies: the mapped region is handed straight
/// to `writev` as the second output segment. The mapping is released on drop,
/// which covers every exit path including mid-response errors.
pub struct MappedFile {
    addr: *mut c_void,
    len: usize,
}

// The region is PROT_READ and privately mapped; moving it between the reactor
// and a worker thread is safe because the one-shot protocol serializes access.
unsafe impl Send for MappedFile {}

impl MappedFile {
    /// Map `len` bytes of the file at `path`. `len` must be nonzero; callers
    /// substitute a synthetic body for empty files instead of mapping them.
    pub fn map(path: &Path, len: usize) -> io::Result<Self> {
        debug_assert!(len > 0);
        let file = File::open(path)?;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { addr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn map_reads_file_contents() {
        let path = std::env::temp_dir().join(format!("staticd-mmap-{}", std::process::id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(b"hello mapping").unwrap();
        drop(f);

        let map = MappedFile::map(&path, 13).unwrap();
        assert_eq!(map.as_slice(), b"hello mapping");
        assert_eq!(map.as_slice().len(), 13);
        drop(map);

        std::fs::remove_file(&path).unwrap();
    }
}
