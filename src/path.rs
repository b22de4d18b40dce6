use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::os::unix::ffi::OsStrExt;

use crate::error::{Error, Result};

/// Name of the control file inside every dual-role node.
pub const MODE_FILE: &str = "mode";

/// Room for `<node>/mode` including the trailing NUL.
pub const PATH_CAPACITY: usize = 128;

/// Longest node name that still fits into [`PATH_CAPACITY`].
pub const MAX_NODE_LEN: usize = PATH_CAPACITY - MODE_FILE.len() - 2;

/// Relative path `<node>/mode`, ready to hand to `openat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModePath(CString);

impl ModePath {
    pub fn new(node: impl AsRef<OsStr>) -> Result<Self> {
        let node = node.as_ref().as_bytes();
        let reject = |reason| Error::InvalidArgument {
            node: String::from_utf8_lossy(node).into_owned(),
            reason,
        };

        if node.is_empty() {
            return Err(reject("node name is empty"));
        }
        if node.len() > MAX_NODE_LEN {
            return Err(reject("node name too long"));
        }

        let mut path = Vec::with_capacity(node.len() + MODE_FILE.len() + 2);
        path.extend_from_slice(node);
        path.push(b'/');
        path.extend_from_slice(MODE_FILE.as_bytes());

        CString::new(path)
            .map(ModePath)
            .map_err(|_| reject("node name contains a NUL byte"))
    }

    pub fn as_c_str(&self) -> &CStr {
        &self.0
    }
}

impl fmt::Display for ModePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}
