//! Read-only private file mappings.
//!
//! A mapping is created when a request resolves to a non-empty file and is
//! released exactly once when the owning value drops, whichever exit path
//! the connection takes (keep-alive reset, close, or a write error
//! mid-response).

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

#[derive(Debug)]
pub struct FileMapping {
    addr: *mut libc::c_void,
    len: usize,
}

// The mapping is only reachable through its owning connection slot, and a
// slot is driven by one thread at a time.
unsafe impl Send for FileMapping {}

impl FileMapping {
    /// Map `len` bytes of `file` read-only and private.
    ///
    /// The descriptor may be closed immediately afterwards; the mapping
    /// outlives it. `len` must be non-zero (the kernel rejects empty maps).
    pub fn map(file: &File, len: usize) -> io::Result<FileMapping> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }
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
        Ok(FileMapping { addr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for FileMapping {
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
    fn test_mapping_reflects_file_contents() {
        let path = std::env::temp_dir().join(format!("fileserv-map-{}", std::process::id()));
        let contents = b"hello from the page cache";
        {
            let mut file = File::create(&path).unwrap();
            file.write_all(contents).unwrap();
        }

        let file = File::open(&path).unwrap();
        let mapping = FileMapping::map(&file, contents.len()).unwrap();
        drop(file);

        assert_eq!(mapping.len(), contents.len());
        assert_eq!(mapping.as_slice(), contents);

        drop(mapping);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_empty_mapping_rejected() {
        let path = std::env::temp_dir().join(format!("fileserv-map0-{}", std::process::id()));
        File::create(&path).unwrap();

        let file = File::open(&path).unwrap();
        assert!(FileMapping::map(&file, 0).is_err());

        std::fs::remove_file(&path).ok();
    }
}
