use std::fs;
use std::path::{Path, PathBuf};

/// Resolves a desktop-file icon name to an icon byte stream.
pub trait IconLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Vec<u8>, String>;
}

const ICON_EXTENSIONS: [&str; 2] = ["png", "svg"];

/// hicolor size directories, closest to the 128px normal thumbnail size first.
const HICOLOR_SIZES: [&str; 10] = [
    "128x128", "256x256", "96x96", "64x64", "512x512", "48x48", "32x32", "24x24", "16x16",
    "scalable",
];

/// Looks icons up in the hicolor theme and pixmaps directories of the XDG
/// data directories.
#[derive(Debug, Clone)]
pub struct XdgIconLookup {
    data_dirs: Vec<PathBuf>,
}

impl XdgIconLookup {
    /// Search `extra_dirs` first, then `$XDG_DATA_HOME` and `$XDG_DATA_DIRS`.
    pub fn new(extra_dirs: Vec<PathBuf>) -> Self {
        let mut data_dirs = extra_dirs;
        if let Some(data_home) = dirs::data_dir() {
            data_dirs.push(data_home);
        }

        let system_dirs = std::env::var("XDG_DATA_DIRS")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "/usr/local/share:/usr/share".to_string());
        data_dirs.extend(
            system_dirs
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        );

        Self::with_data_dirs(data_dirs)
    }

    pub fn with_data_dirs(data_dirs: Vec<PathBuf>) -> Self {
        XdgIconLookup { data_dirs }
    }

    /// Candidate files for `name`, in lookup order.
    pub fn candidate_paths(&self, name: &str) -> Vec<PathBuf> {
        let name = strip_icon_extension(name);
        let mut candidates = Vec::new();

        for data_dir in &self.data_dirs {
            let hicolor = data_dir.join("icons").join("hicolor");
            for size in HICOLOR_SIZES {
                for ext in ICON_EXTENSIONS {
                    candidates.push(hicolor.join(size).join("apps").join(format!("{}.{}", name, ext)));
                }
            }
        }
        for data_dir in &self.data_dirs {
            for ext in ICON_EXTENSIONS {
                candidates.push(data_dir.join("pixmaps").join(format!("{}.{}", name, ext)));
            }
        }

        candidates
    }
}

impl IconLookup for XdgIconLookup {
    fn lookup(&self, name: &str) -> Result<Vec<u8>, String> {
        if name.is_empty() {
            return Err("Empty icon name".to_string());
        }

        let as_path = Path::new(name);
        if as_path.is_absolute() {
            return fs::read(as_path).map_err(|e| format!("Failed to read icon {}: {}", name, e));
        }
        if name.contains('/') {
            return Err(format!("Invalid icon name: {}", name));
        }

        self.candidate_paths(name)
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| format!("Icon '{}' not found in {} data dirs", name, self.data_dirs.len()))
            .and_then(|p| {
                log::debug!("Resolved icon '{}' to {}", name, p.display());
                fs::read(&p).map_err(|e| format!("Failed to read icon {}: {}", p.display(), e))
            })
    }
}

fn strip_icon_extension(name: &str) -> &str {
    for ext in ICON_EXTENSIONS.iter().chain(["xpm"].iter()) {
        if let Some(stem) = name.strip_suffix(&format!(".{}", ext)) {
            return stem;
        }
    }
    name
}
