//! Request target resolution under the document root.
//!
//! A target is joined onto the root, canonicalized, and byte-prefix checked
//! against the root before anything is opened. The `..` rejection and the
//! post-canonicalization prefix check are both load-bearing: the first
//! stops traversal through the join, the second stops traversal through
//! symlinks inside the tree.

use super::mapping::FileMapping;
use super::{HttpCode, FILENAME_LEN};
use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// File body carried by a 200 response.
#[derive(Debug)]
pub enum FileBody {
    /// Zero-length file; the placeholder body is sent instead.
    Empty,
    /// Memory-mapped contents for the writev path.
    Mapped(FileMapping),
    /// Open descriptor and length for the sendfile path.
    Streamed { file: File, len: usize },
}

impl FileBody {
    pub fn len(&self) -> usize {
        match self {
            FileBody::Empty => 0,
            FileBody::Mapped(mapping) => mapping.len(),
            FileBody::Streamed { len, .. } => *len,
        }
    }
}

/// Resolve a request target to a served file.
///
/// `doc_root` must already be canonical. Returns the body handle for the
/// 200 path, or the HTTP code the request must be answered with.
pub fn resolve(doc_root: &Path, url: &[u8], use_sendfile: bool) -> Result<FileBody, HttpCode> {
    debug_assert_eq!(url.first(), Some(&b'/'));

    let mut path = doc_root.to_path_buf();
    if url == b"/" {
        path.push("index.html");
    } else {
        if url.windows(2).any(|pair| pair == b"..") {
            return Err(HttpCode::ForbiddenRequest);
        }
        path.push(OsStr::from_bytes(&url[1..]));
    }
    if path.as_os_str().len() + 1 > FILENAME_LEN {
        return Err(HttpCode::BadRequest);
    }

    let real_path = path.canonicalize().map_err(|_| HttpCode::NoResource)?;
    if !real_path
        .as_os_str()
        .as_bytes()
        .starts_with(doc_root.as_os_str().as_bytes())
    {
        return Err(HttpCode::ForbiddenRequest);
    }

    let meta = std::fs::metadata(&real_path).map_err(|_| HttpCode::NoResource)?;
    if !readable(&real_path) {
        return Err(HttpCode::ForbiddenRequest);
    }
    if meta.is_dir() {
        return Err(HttpCode::BadRequest);
    }

    let len = meta.len() as usize;
    if len == 0 {
        return Ok(FileBody::Empty);
    }

    let file = File::open(&real_path).map_err(open_error)?;
    if use_sendfile {
        Ok(FileBody::Streamed { file, len })
    } else {
        // The descriptor drops here; the mapping outlives it.
        let mapping = FileMapping::map(&file, len).map_err(|_| HttpCode::InternalError)?;
        Ok(FileBody::Mapped(mapping))
    }
}

fn readable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK) == 0 }
}

fn open_error(err: io::Error) -> HttpCode {
    match err.kind() {
        io::ErrorKind::NotFound => HttpCode::NoResource,
        io::ErrorKind::PermissionDenied => HttpCode::ForbiddenRequest,
        _ => HttpCode::InternalError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    struct TestRoot {
        root: PathBuf,
        outside: PathBuf,
    }

    impl TestRoot {
        fn new(tag: &str) -> TestRoot {
            let base = std::env::temp_dir().join(format!(
                "fileserv-resolver-{}-{tag}",
                std::process::id()
            ));
            let root = base.join("root");
            std::fs::create_dir_all(&root).unwrap();
            let mut index = File::create(root.join("index.html")).unwrap();
            index.write_all(b"hi world\n").unwrap();

            let outside = base.join("secret.txt");
            let mut secret = File::create(&outside).unwrap();
            secret.write_all(b"do not serve\n").unwrap();

            TestRoot {
                root: root.canonicalize().unwrap(),
                outside,
            }
        }
    }

    impl Drop for TestRoot {
        fn drop(&mut self) {
            std::fs::remove_dir_all(self.root.parent().unwrap()).ok();
        }
    }

    #[test]
    fn test_root_serves_index() {
        let env = TestRoot::new("index");
        let body = resolve(&env.root, b"/", false).unwrap();
        match body {
            FileBody::Mapped(mapping) => assert_eq!(mapping.as_slice(), b"hi world\n"),
            _ => panic!("expected a mapped body"),
        }
    }

    #[test]
    fn test_dotdot_forbidden() {
        let env = TestRoot::new("dotdot");
        assert_eq!(
            resolve(&env.root, b"/../secret.txt", false).unwrap_err(),
            HttpCode::ForbiddenRequest
        );
        assert_eq!(
            resolve(&env.root, b"/a/../../secret.txt", false).unwrap_err(),
            HttpCode::ForbiddenRequest
        );
    }

    #[test]
    fn test_symlink_escape_forbidden() {
        let env = TestRoot::new("symlink");
        std::os::unix::fs::symlink(&env.outside, env.root.join("escape")).unwrap();
        assert_eq!(
            resolve(&env.root, b"/escape", false).unwrap_err(),
            HttpCode::ForbiddenRequest
        );
    }

    #[test]
    fn test_missing_file_not_found() {
        let env = TestRoot::new("missing");
        assert_eq!(
            resolve(&env.root, b"/nothing-here", false).unwrap_err(),
            HttpCode::NoResource
        );
    }

    #[test]
    fn test_directory_target_rejected() {
        let env = TestRoot::new("dir");
        std::fs::create_dir(env.root.join("sub")).unwrap();
        assert_eq!(
            resolve(&env.root, b"/sub", false).unwrap_err(),
            HttpCode::BadRequest
        );
    }

    #[test]
    fn test_oversized_path_rejected() {
        let env = TestRoot::new("long");
        let long = format!("/{}", "a".repeat(FILENAME_LEN));
        assert_eq!(
            resolve(&env.root, long.as_bytes(), false).unwrap_err(),
            HttpCode::BadRequest
        );
    }

    #[test]
    fn test_empty_file_served_as_placeholder() {
        let env = TestRoot::new("empty");
        File::create(env.root.join("blank")).unwrap();
        match resolve(&env.root, b"/blank", false).unwrap() {
            FileBody::Empty => {}
            _ => panic!("expected an empty body"),
        }
    }

    #[test]
    fn test_sendfile_keeps_descriptor() {
        let env = TestRoot::new("sendfile");
        match resolve(&env.root, b"/index.html", true).unwrap() {
            FileBody::Streamed { len, .. } => assert_eq!(len, 9),
            _ => panic!("expected a streamed body"),
        }
    }

    #[test]
    fn test_plain_file_served() {
        let env = TestRoot::new("plain");
        match resolve(&env.root, b"/index.html", false).unwrap() {
            FileBody::Mapped(mapping) => assert_eq!(mapping.as_slice(), b"hi world\n"),
            _ => panic!("expected a mapped body"),
        }
    }
}
