use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ThumbnailError};

pub const USAGE: &str = "\
Usage: appthumbd [OPTIONS] [BUNDLE...]

Writes freedesktop thumbnails for application bundles and keeps them
current while watching bundle directories.

Options:
  --config PATH       read configuration from PATH
  --cache-home PATH   use PATH instead of $XDG_CACHE_HOME
  --watch DIR         watch DIR for bundles (repeatable)
  --once              thumbnail the given bundles and exit
  --verbose           log debug messages
  -h, --help          print this help
";

/// Daemon settings, read from `$XDG_CONFIG_HOME/appthumb/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root of the thumbnail cache; `$XDG_CACHE_HOME` when unset.
    pub cache_home: Option<PathBuf>,
    pub watch_dirs: Vec<PathBuf>,
    /// Searched like XDG data dirs before the system ones.
    pub icon_dirs: Vec<PathBuf>,
    pub max_concurrent: Option<usize>,
    pub verbose: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            cache_home: None,
            watch_dirs: dirs::home_dir()
                .map(|home| vec![home.join("Applications")])
                .unwrap_or_default(),
            icon_dirs: Vec::new(),
            max_concurrent: None,
            verbose: false,
        }
    }
}

impl DaemonConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("appthumb").join("config.json"))
    }

    /// Load from `path`, or from the default location when `path` is `None`.
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                return Err(ThumbnailError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|e| {
            ThumbnailError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| ThumbnailError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Command-line flags take precedence over the file.
    pub fn apply_args(&mut self, args: &CliArgs) {
        if let Some(cache_home) = &args.cache_home {
            self.cache_home = Some(cache_home.clone());
        }
        if !args.watch_dirs.is_empty() {
            self.watch_dirs = args.watch_dirs.clone();
        }
        self.verbose |= args.verbose;
    }

    pub fn cache_home(&self) -> Result<PathBuf> {
        self.cache_home
            .clone()
            .or_else(dirs::cache_dir)
            .ok_or_else(|| ThumbnailError::Config("Could not determine cache directory".to_string()))
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub cache_home: Option<PathBuf>,
    pub watch_dirs: Vec<PathBuf>,
    pub once: bool,
    pub verbose: bool,
    pub help: bool,
    pub bundles: Vec<PathBuf>,
}

impl CliArgs {
    pub fn from_env() -> Result<Self> {
        Self::parse(pico_args::Arguments::from_env())
    }

    pub fn from_vec(args: Vec<OsString>) -> Result<Self> {
        Self::parse(pico_args::Arguments::from_vec(args))
    }

    fn parse(mut args: pico_args::Arguments) -> Result<Self> {
        let invalid = |e: pico_args::Error| ThumbnailError::Config(e.to_string());

        let help = args.contains(["-h", "--help"]);
        let once = args.contains("--once");
        let verbose = args.contains("--verbose");
        let config = args.opt_value_from_str("--config").map_err(invalid)?;
        let cache_home = args.opt_value_from_str("--cache-home").map_err(invalid)?;
        let watch_dirs = args.values_from_str("--watch").map_err(invalid)?;

        let mut bundles = Vec::new();
        for arg in args.finish() {
            if arg.to_str().is_some_and(|s| s.starts_with('-')) {
                return Err(ThumbnailError::Config(format!(
                    "Unknown option: {}",
                    arg.to_string_lossy()
                )));
            }
            bundles.push(PathBuf::from(arg));
        }

        Ok(CliArgs {
            config,
            cache_home,
            watch_dirs,
            once,
            verbose,
            help,
            bundles,
        })
    }
}
