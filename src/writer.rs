use std::ffi::{CStr, CString, OsStr};
use std::fs::File;
use std::io::{self, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::ptr::NonNull;

use log::{debug, error, info};

use crate::basedir::{close_fd, BaseDir};
use crate::error::{Error, Result};
use crate::path::ModePath;

/// Bytes written into a node's mode file.
pub const HOST_MODE: &[u8] = b"host";

/// Outcome of one pass over the requested nodes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub written: usize,
    /// Directories without a mode file, only counted while enumerating.
    pub skipped: usize,
    pub failed: usize,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn fail(&mut self, err: &Error) {
        error!("{err}");
        self.failed += 1;
    }
}

/// Put a single named node into host mode.
pub fn write_node(base: &BaseDir, node: impl AsRef<OsStr>) -> Result<()> {
    let path = ModePath::new(node)?;
    write_mode_file(base, &path)
}

/// Open `path` below `base`, write [`HOST_MODE`] once and close it again.
///
/// When both the write and the close fail the write error is logged and the
/// close error returned.
fn write_mode_file(base: &BaseDir, path: &ModePath) -> Result<()> {
    let fd = unsafe {
        libc::openat(
            base.as_raw_fd(),
            path.as_c_str().as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(Error::OpenFailed {
            path: path.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    let mut file = unsafe { File::from_raw_fd(fd) };

    let written = write_host(&mut file, path);
    let closed = close_fd(OwnedFd::from(file));
    settle_close(path, written, closed)
}

/// Single write of [`HOST_MODE`]; a short count is a failure, never retried.
fn write_host(w: &mut impl Write, path: &ModePath) -> Result<()> {
    match w.write(HOST_MODE) {
        Ok(n) if n == HOST_MODE.len() => Ok(()),
        Ok(written) => Err(Error::ShortWrite {
            path: path.to_string(),
            written,
        }),
        Err(source) => Err(Error::WriteFailed {
            path: path.to_string(),
            source,
        }),
    }
}

/// Last error wins: a close failure replaces (and logs) a write failure.
fn settle_close(path: &ModePath, written: Result<()>, closed: io::Result<()>) -> Result<()> {
    match closed {
        Ok(()) => written,
        Err(source) => {
            if let Err(err) = written {
                error!("{err}");
            }
            Err(Error::CloseFailed {
                path: path.to_string(),
                source,
            })
        }
    }
}

/// Put every node named on the command line into host mode.
///
/// Each name is written exactly once; a failing node does not stop the rest.
pub fn write_nodes<S: AsRef<OsStr>>(base: &BaseDir, nodes: &[S]) -> Summary {
    let mut summary = Summary::default();
    for node in nodes {
        let node = node.as_ref();
        match write_node(base, node) {
            Ok(()) => {
                info!("put node '{}' into host mode", node.to_string_lossy());
                summary.written += 1;
            }
            Err(err) => {
                summary.fail(&err);
                error!("failed to put node '{}' to host mode", node.to_string_lossy());
            }
        }
    }
    summary
}

/// Put every dual-role node found under `base` into host mode.
///
/// Directories without a mode file are skipped, everything else that goes
/// wrong is logged and counted while the enumeration carries on.
pub fn write_all_nodes(base: &BaseDir) -> Summary {
    let mut summary = Summary::default();
    let enumeration_failed = |source| Error::EnumerationFailed {
        path: base.path().to_path_buf(),
        source,
    };

    let mut dir = match DirStream::open(base) {
        Ok(dir) => dir,
        Err(source) => {
            summary.fail(&enumeration_failed(source));
            return summary;
        }
    };

    loop {
        let entry = match dir.next_entry() {
            Some(Ok(entry)) => entry,
            Some(Err(source)) => {
                summary.fail(&enumeration_failed(source));
                break;
            }
            None => break,
        };

        let name = entry.name.as_bytes();
        if name.is_empty() {
            summary.fail(&Error::InvalidArgument {
                node: String::new(),
                reason: "empty directory entry name",
            });
            continue;
        }
        if name == b"." || name == b".." {
            continue;
        }

        match entry.is_dir(base) {
            Ok(true) => {}
            Ok(false) => {
                debug!("skipping non-directory entry '{}'", entry.name.to_string_lossy());
                continue;
            }
            Err(source) => {
                summary.fail(&enumeration_failed(source));
                continue;
            }
        }

        let path = match ModePath::new(OsStr::from_bytes(name)) {
            Ok(path) => path,
            Err(err) => {
                summary.fail(&err);
                continue;
            }
        };

        match write_mode_file(base, &path) {
            Ok(()) => {
                info!("put node '{}' into host mode", entry.name.to_string_lossy());
                summary.written += 1;
            }
            Err(err) if err.is_not_found() => {
                debug!("no mode file in '{}', not a dual-role node", entry.name.to_string_lossy());
                summary.skipped += 1;
            }
            Err(err) => summary.fail(&err),
        }
    }

    if let Err(source) = dir.close() {
        summary.fail(&Error::CloseFailed {
            path: base.path().display().to_string(),
            source,
        });
    }

    summary
}

struct DirEntry {
    name: CString,
    d_type: u8,
}

impl DirEntry {
    /// Trusts `d_type` unless the filesystem left it unknown.
    fn is_dir(&self, base: &BaseDir) -> io::Result<bool> {
        if self.d_type != libc::DT_UNKNOWN {
            return Ok(self.d_type == libc::DT_DIR);
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        let ret = unsafe {
            libc::fstatat(
                base.as_raw_fd(),
                self.name.as_ptr(),
                stat.as_mut_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let stat = unsafe { stat.assume_init() };
        Ok(stat.st_mode & libc::S_IFMT == libc::S_IFDIR)
    }
}

/// `DIR *` over a duplicate of the base descriptor, so the stream can own
/// (and close) its descriptor while the caller keeps the original.
struct DirStream {
    dir: NonNull<libc::DIR>,
}

impl DirStream {
    fn open(base: &BaseDir) -> io::Result<Self> {
        let fd = unsafe { libc::fcntl(base.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let Some(dir) = NonNull::new(unsafe { libc::fdopendir(fd) }) else {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        };
        // The duplicate shares its offset with the base descriptor.
        unsafe { libc::rewinddir(dir.as_ptr()) };

        Ok(DirStream { dir })
    }

    fn next_entry(&mut self) -> Option<io::Result<DirEntry>> {
        // glibc and musl only; bionic spells it __errno.
        unsafe { *libc::__errno_location() = 0 };
        let entry = unsafe { libc::readdir(self.dir.as_ptr()) };
        if entry.is_null() {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(0) | None => None,
                Some(_) => Some(Err(err)),
            };
        }

        let entry = unsafe { &*entry };
        let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
        Some(Ok(DirEntry {
            name: name.to_owned(),
            d_type: entry.d_type,
        }))
    }

    fn close(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        if unsafe { libc::closedir(this.dir.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn node(base: &Path, name: &str) {
        fs::create_dir(base.join(name)).unwrap();
        fs::write(base.join(name).join("mode"), b"device").unwrap();
    }

    fn mode(base: &Path, name: &str) -> Vec<u8> {
        fs::read(base.join(name).join("mode")).unwrap()
    }

    struct ShortWriter;

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len().min(2))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EIO))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_host_writes_all_four_bytes() {
        let path = ModePath::new("A").unwrap();
        let mut out = Vec::new();
        write_host(&mut out, &path).unwrap();
        assert_eq!(out, HOST_MODE);
    }

    #[test]
    fn short_write_is_a_failure() {
        let path = ModePath::new("A").unwrap();
        match write_host(&mut ShortWriter, &path).unwrap_err() {
            Error::ShortWrite { path, written } => {
                assert_eq!(path, "A/mode");
                assert_eq!(written, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn write_error_is_write_failed() {
        let path = ModePath::new("A").unwrap();
        match write_host(&mut BrokenWriter, &path).unwrap_err() {
            Error::WriteFailed { source, .. } => assert_eq!(source.raw_os_error(), Some(libc::EIO)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn close_error_wins_over_write_error() {
        let path = ModePath::new("A").unwrap();
        let written = write_host(&mut BrokenWriter, &path);
        let closed = Err(io::Error::from_raw_os_error(libc::EBADF));
        match settle_close(&path, written, closed).unwrap_err() {
            Error::CloseFailed { source, .. } => assert_eq!(source.raw_os_error(), Some(libc::EBADF)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn close_error_alone_is_reported() {
        let path = ModePath::new("A").unwrap();
        let closed = Err(io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(
            settle_close(&path, Ok(()), closed),
            Err(Error::CloseFailed { .. })
        ));
    }

    #[test]
    fn write_error_stands_when_close_succeeds() {
        let path = ModePath::new("A").unwrap();
        let written = write_host(&mut ShortWriter, &path);
        assert!(matches!(
            settle_close(&path, written, Ok(())),
            Err(Error::ShortWrite { written: 2, .. })
        ));
    }

    fn unknown(name: &str) -> DirEntry {
        DirEntry {
            name: CString::new(name).unwrap(),
            d_type: libc::DT_UNKNOWN,
        }
    }

    #[test]
    fn unknown_entry_type_falls_back_to_stat() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(tempdir.path().join("A")).unwrap();
        fs::write(tempdir.path().join("f"), b"").unwrap();
        std::os::unix::fs::symlink("A", tempdir.path().join("link")).unwrap();

        let base = BaseDir::open(tempdir.path()).unwrap();
        assert!(unknown("A").is_dir(&base).unwrap());
        assert!(!unknown("f").is_dir(&base).unwrap());
        // Symlinks are not followed.
        assert!(!unknown("link").is_dir(&base).unwrap());
        let err = unknown("gone").is_dir(&base).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn known_entry_type_is_trusted() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let base = BaseDir::open(tempdir.path()).unwrap();
        let entry = DirEntry {
            name: CString::new("gone").unwrap(),
            d_type: libc::DT_DIR,
        };
        assert!(entry.is_dir(&base).unwrap());
    }

    #[test]
    fn write_node_writes_host() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        node(tempdir.path(), "A");

        let base = BaseDir::open(tempdir.path()).unwrap();
        write_node(&base, "A").unwrap();
        base.close().unwrap();

        // O_WRONLY without O_TRUNC overwrites in place.
        assert_eq!(mode(tempdir.path(), "A"), b"hostce");
    }

    #[test]
    fn write_node_is_idempotent() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(tempdir.path().join("A")).unwrap();
        fs::write(tempdir.path().join("A/mode"), b"").unwrap();

        let base = BaseDir::open(tempdir.path()).unwrap();
        write_node(&base, "A").unwrap();
        write_node(&base, "A").unwrap();
        assert_eq!(mode(tempdir.path(), "A"), HOST_MODE);
    }

    #[test]
    fn write_node_missing_mode_file_fails() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(tempdir.path().join("A")).unwrap();

        let base = BaseDir::open(tempdir.path()).unwrap();
        let err = write_node(&base, "A").unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[test]
    fn write_node_rejects_empty_name() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let base = BaseDir::open(tempdir.path()).unwrap();
        assert!(matches!(
            write_node(&base, ""),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn write_failure_is_reported() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(tempdir.path().join("A")).unwrap();
        std::os::unix::fs::symlink("/dev/full", tempdir.path().join("A/mode")).unwrap();

        let base = BaseDir::open(tempdir.path()).unwrap();
        match write_node(&base, "A").unwrap_err() {
            Error::WriteFailed { path, source } => {
                assert_eq!(path, "A/mode");
                assert_eq!(source.raw_os_error(), Some(libc::ENOSPC));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn all_nodes_skips_files_and_dirs_without_mode() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        node(tempdir.path(), "A");
        fs::create_dir(tempdir.path().join("usb-hub")).unwrap();
        fs::write(tempdir.path().join("devices"), b"").unwrap();

        let base = BaseDir::open(tempdir.path()).unwrap();
        let summary = write_all_nodes(&base);
        base.close().unwrap();

        assert_eq!(
            summary,
            Summary {
                written: 1,
                skipped: 1,
                failed: 0
            }
        );
        assert_eq!(fs::read(tempdir.path().join("devices")).unwrap(), b"");
    }

    #[test]
    fn all_nodes_twice_on_same_base() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        node(tempdir.path(), "A");
        node(tempdir.path(), "B");

        let base = BaseDir::open(tempdir.path()).unwrap();
        assert_eq!(write_all_nodes(&base).written, 2);
        assert_eq!(write_all_nodes(&base).written, 2);
    }

    #[test]
    fn named_nodes_are_each_written_once() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        node(tempdir.path(), "A");
        node(tempdir.path(), "B");
        node(tempdir.path(), "C");

        let base = BaseDir::open(tempdir.path()).unwrap();
        let summary = write_nodes(&base, &["A", "B"]);
        assert_eq!(summary.written, 2);
        assert!(summary.is_success());
        assert_eq!(mode(tempdir.path(), "A"), b"hostce");
        assert_eq!(mode(tempdir.path(), "B"), b"hostce");
        assert_eq!(mode(tempdir.path(), "C"), b"device");
    }

    #[test]
    fn named_nodes_continue_past_failures() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        node(tempdir.path(), "B");

        let base = BaseDir::open(tempdir.path()).unwrap();
        let summary = write_nodes(&base, &["missing", "B"]);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.written, 1);
        assert!(!summary.is_success());
    }
}
