use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

/// Read-only descriptor on the directory holding the dual-role nodes.
///
/// Dropping it closes the descriptor silently; call [`BaseDir::close`] to
/// learn about close failures.
#[derive(Debug)]
pub struct BaseDir {
    fd: OwnedFd,
    path: PathBuf,
}

impl BaseDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let invalid = |source| Error::InvalidState {
            path: path.clone(),
            source,
        };

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| invalid(io::Error::from(io::ErrorKind::InvalidInput)))?;
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(invalid(io::Error::last_os_error()));
        }
        debug!("opened base directory {} as fd {fd}", path.display());

        Ok(BaseDir {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) -> Result<()> {
        let path = self.path.display().to_string();
        close_fd(self.fd).map_err(|source| Error::CloseFailed { path, source })
    }
}

impl AsFd for BaseDir {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for BaseDir {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Close a descriptor and report the result, which `OwnedFd`'s drop discards.
pub(crate) fn close_fd(fd: OwnedFd) -> io::Result<()> {
    let raw = fd.into_raw_fd();
    if unsafe { libc::close(raw) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
