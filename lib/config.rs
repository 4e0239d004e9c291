use crate::backend::Kind;
use crate::error::{Error, Result};
use crate::utils::parse_size;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SOCKET: &str = "/tmp/tierfs.sock";
pub const DEFAULT_LOG: &str = "/tmp/tierfs.log";

/// Type tag plus the `key=value` options of one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: Kind,
    pub options: Vec<(String, String)>,
}

impl BackendConfig {
    /// `kind` is case insensitive, every option must look like `key=value`
    pub fn parse(kind: &str, opts: &[String]) -> Result<Self> {
        let kind = kind.parse::<Kind>()?;
        let mut options = Vec::with_capacity(opts.len());
        for o in opts {
            let (k, v) = o
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("option {o:?} is not key=value")))?;
            let k = k.trim();
            if k.is_empty() {
                return Err(Error::Config(format!("option {o:?} has an empty key")));
            }
            options.push((k.to_ascii_lowercase(), v.trim().to_string()));
        }
        Ok(Self { kind, options })
    }

    /// the last occurrence of a key wins
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::Config(format!("{} backend requires option '{key}'", self.kind)))
    }

    pub fn size(&self, key: &str) -> Result<Option<u64>> {
        self.get(key).map(parse_size).transpose()
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "tierfs")]
#[command(about = "serve hot files of a directory from an in-memory tier")]
#[command(version)]
pub struct MountArgs {
    /// Directory to mirror
    pub root: PathBuf,

    /// Where to mount it
    pub mountpoint: PathBuf,

    /// Backend type, dram or nvram
    #[arg(short, long, default_value = "dram")]
    pub backend: String,

    /// Backend option key=value, e.g. capacity=4GB, chunk=64MiB, path=/mnt/pmem
    #[arg(short = 'o', long = "option")]
    pub options: Vec<String>,

    /// Control socket
    #[arg(short, long, default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,

    /// Log file, `-` logs to stderr
    #[arg(long, default_value = DEFAULT_LOG)]
    pub log_file: PathBuf,

    #[arg(long, env = "TIERFS_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Range lock wait in milliseconds before an I/O fails with ETIMEDOUT
    #[arg(long, default_value_t = 5000)]
    pub lock_timeout: u64,

    /// Allow other users to access the mount
    #[arg(long, default_value_t = false)]
    pub allow_other: bool,

    /// Files under root to load right after mounting, relative to root
    #[arg(long)]
    pub preload: Vec<PathBuf>,
}

impl MountArgs {
    pub fn backend_config(&self) -> Result<BackendConfig> {
        BackendConfig::parse(&self.backend, &self.options)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout)
    }

    pub fn log_level(&self) -> Result<log::LevelFilter> {
        self.log_level
            .parse::<log::LevelFilter>()
            .map_err(|_| Error::Config(format!("invalid log level {:?}", self.log_level)))
    }
}
