//! Process wide state, built once at startup and shared by the relay and the control server.

use crate::backend::{self, Backend};
use crate::config::MountArgs;
use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Context {
    backend: Arc<dyn Backend>,
    root: PathBuf,
    mountpoint: PathBuf,
    lock_timeout: Duration,
    down: AtomicBool,
}

impl Context {
    pub fn new(backend: Arc<dyn Backend>, root: &Path, mountpoint: &Path, lock_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend,
            root: root.to_path_buf(),
            mountpoint: mountpoint.to_path_buf(),
            lock_timeout,
            down: AtomicBool::new(false),
        })
    }

    pub fn from_args(args: &MountArgs) -> Result<Arc<Self>> {
        let root = args.root.canonicalize()?;
        let mountpoint = args.mountpoint.canonicalize()?;
        if !root.is_dir() {
            return Err(Error::Config(format!("{} is not a directory", root.display())));
        }
        let backend = backend::create_from_options(&args.backend_config()?)?;
        Ok(Self::new(backend, &root, &mountpoint, args.lock_timeout()))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Map a path given by a client to the source path cached files are keyed by. Paths
    /// through the mountpoint are rebased on the root, relative paths are taken relative to
    /// the root. Anything outside the root is rejected.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let abs = if path.is_absolute() {
            match path.strip_prefix(&self.mountpoint) {
                Ok(rel) => self.root.join(rel),
                Err(_) => path.to_path_buf(),
            }
        } else {
            self.root.join(path)
        };
        if abs.components().any(|c| c == Component::ParentDir) {
            return Err(Error::Unsupported(format!("{} contains '..'", path.display())));
        }
        if !abs.starts_with(&self.root) {
            return Err(Error::Unsupported(format!(
                "{} is outside {}",
                path.display(),
                self.root.display()
            )));
        }
        Ok(abs)
    }

    /// unload everything once, later calls do nothing
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        let failed = self.backend.unload_all();
        if failed > 0 {
            log::error!("shutdown: {} files could not be written back", failed);
        } else {
            log::info!("shutdown: all files unloaded");
        }
    }
}
