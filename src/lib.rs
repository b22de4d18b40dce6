//! Put USB dual-role ports into host mode.
//!
//! Every dual-role controller exposes a `mode` file in its own directory under
//! debugfs (`/sys/kernel/debug/usb/<node>/mode`). Writing `host` into that file
//! switches the port's role. Nodes are either named explicitly or discovered
//! by enumerating the base directory.

use std::ffi::OsStr;
use std::path::PathBuf;

use log::{error, warn};

pub mod basedir;
pub mod error;
pub mod path;
pub mod writer;

pub use basedir::BaseDir;
pub use error::{Error, Result};
pub use path::ModePath;
pub use writer::{write_all_nodes, write_node, write_nodes, Summary, HOST_MODE};

/// Where the kernel exposes the dual-role controllers.
pub const DEFAULT_BASE_DIR: &str = "/sys/kernel/debug/usb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
        }
    }
}

/// Put the named nodes, or every node when `nodes` is empty, into host mode.
///
/// Only a base directory that cannot be opened is an `Err`; per-node failures
/// are logged and counted in the returned [`Summary`].
pub fn run<S: AsRef<OsStr>>(config: &Config, nodes: &[S]) -> Result<Summary> {
    let base = BaseDir::open(&config.base_dir)?;

    let mut summary = if nodes.is_empty() {
        warn!(
            "no nodes given, trying to put all usb nodes under '{}' into host mode",
            base.path().display()
        );
        write_all_nodes(&base)
    } else {
        write_nodes(&base, nodes)
    };

    if let Err(err) = base.close() {
        error!("{err}");
        summary.failed += 1;
    }
    Ok(summary)
}
