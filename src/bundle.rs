use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use url::Url;

/// An application bundle that can be thumbnailed.
///
/// The pipeline only borrows a bundle for the duration of one run and never
/// retains anything it returns.
pub trait Bundle: Send + Sync {
    /// Absolute canonical path of the bundle.
    fn path(&self) -> &Path;

    /// `file://` URI of the bundle, used as the cache key and as `Thumb::URI`.
    fn canonical_uri(&self) -> &str;

    /// Modification time of the bundle, used as `Thumb::MTime` and as the
    /// filesystem mtime of the thumbnail.
    fn modified(&self) -> DateTime<Utc>;

    /// The bundle's embedded default icon stream.
    fn dir_icon(&self) -> Result<Vec<u8>, String>;

    /// Icon name declared by the bundle's desktop file, if any.
    fn desktop_icon_name(&self) -> Option<String>;
}

/// Build the canonical `file://` URI for an absolute path.
pub fn canonical_uri_for(path: &Path) -> Result<String, String> {
    Url::from_file_path(path)
        .map(|url| url.to_string())
        .map_err(|_| format!("Not an absolute path: {}", path.display()))
}

/// An unpacked application directory: an `AppRun` entry point, a `.DirIcon`
/// and a top-level desktop file.
#[derive(Debug, Clone)]
pub struct AppDirBundle {
    path: PathBuf,
    uri: String,
    modified: DateTime<Utc>,
}

impl AppDirBundle {
    pub fn open(path: &Path) -> Result<Self, String> {
        let path =
            fs::canonicalize(path).map_err(|e| format!("Failed to resolve bundle path: {}", e))?;
        let metadata =
            fs::metadata(&path).map_err(|e| format!("Failed to get metadata: {}", e))?;

        if !metadata.is_dir() {
            return Err(format!("Not an application directory: {}", path.display()));
        }

        let dir_modified = metadata
            .modified()
            .map_err(|e| format!("Failed to read modification time: {}", e))?;
        let modified = DateTime::<Utc>::from(newest_content_mtime(&path, dir_modified));
        let uri = canonical_uri_for(&path)?;

        Ok(AppDirBundle {
            path,
            uri,
            modified,
        })
    }

    /// Whether `path` looks like an application directory.
    pub fn is_app_dir(path: &Path) -> bool {
        path.is_dir() && path.join("AppRun").exists()
    }
}

fn desktop_file_in(dir: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().and_then(|s| s.to_str()) == Some("desktop"))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Files rewritten in place do not touch the directory mtime, so the
/// entries the icon comes from count too. Symlinks are followed.
fn newest_content_mtime(dir: &Path, dir_modified: SystemTime) -> SystemTime {
    [
        Some(dir.join(".DirIcon")),
        Some(dir.join("AppRun")),
        desktop_file_in(dir),
    ]
    .into_iter()
    .flatten()
    .filter_map(|path| fs::metadata(path).and_then(|m| m.modified()).ok())
    .fold(dir_modified, SystemTime::max)
}

impl Bundle for AppDirBundle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn canonical_uri(&self) -> &str {
        &self.uri
    }

    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    fn dir_icon(&self) -> Result<Vec<u8>, String> {
        if !Self::is_app_dir(&self.path) {
            return Err(format!(
                "Not a recognized application directory (missing AppRun): {}",
                self.path.display()
            ));
        }
        fs::read(self.path.join(".DirIcon")).map_err(|e| format!("Failed to read .DirIcon: {}", e))
    }

    fn desktop_icon_name(&self) -> Option<String> {
        let desktop_file = desktop_file_in(&self.path)?;
        let contents = fs::read_to_string(&desktop_file).ok()?;
        parse_desktop_icon(&contents)
    }
}

/// Extract the unlocalized `Icon=` key of the `[Desktop Entry]` group.
pub fn parse_desktop_icon(contents: &str) -> Option<String> {
    let mut in_entry = false;

    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_entry = line == "[Desktop Entry]";
            continue;
        }
        if !in_entry || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            if key.trim() == "Icon" && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_app_dir(root: &Path) -> PathBuf {
        let app_dir = root.join("Example.AppDir");
        fs::create_dir_all(&app_dir).expect("Failed to create AppDir");
        fs::write(app_dir.join("AppRun"), b"#!/bin/sh\n").expect("Failed to write AppRun");
        app_dir
    }

    #[test]
    fn test_parse_desktop_icon_reads_desktop_entry_group() {
        let contents = "\
[Desktop Entry]
Name=Example
Icon[de]=beispiel
Icon = example-app
Exec=AppRun

[Desktop Action New]
Icon=other
";
        assert_eq!(parse_desktop_icon(contents).as_deref(), Some("example-app"));
    }

    #[test]
    fn test_parse_desktop_icon_ignores_other_groups() {
        let contents = "[Desktop Action New]\nIcon=other\n[Desktop Entry]\nName=Example\n";
        assert_eq!(parse_desktop_icon(contents), None);
    }

    #[test]
    fn test_canonical_uri_percent_encodes() {
        let uri = canonical_uri_for(Path::new("/home/u/My App.AppImage")).unwrap();
        assert_eq!(uri, "file:///home/u/My%20App.AppImage");
    }

    #[test]
    fn test_canonical_uri_rejects_relative_path() {
        assert!(canonical_uri_for(Path::new("relative/App.AppImage")).is_err());
    }

    #[test]
    fn test_app_dir_bundle_reads_dir_icon_and_desktop_icon() {
        let dir = tempdir().expect("Failed to create temp dir");
        let app_dir = make_app_dir(dir.path());
        fs::write(app_dir.join(".DirIcon"), b"icon-bytes").expect("Failed to write .DirIcon");
        fs::write(
            app_dir.join("example.desktop"),
            "[Desktop Entry]\nName=Example\nIcon=example\n",
        )
        .expect("Failed to write desktop file");

        let bundle = AppDirBundle::open(&app_dir).expect("Failed to open bundle");

        assert!(bundle.canonical_uri().starts_with("file:///"));
        assert!(bundle.canonical_uri().ends_with("/Example.AppDir"));
        assert_eq!(bundle.dir_icon().unwrap(), b"icon-bytes");
        assert_eq!(bundle.desktop_icon_name().as_deref(), Some("example"));
    }

    #[test]
    fn test_app_dir_bundle_mtime_follows_icon_and_desktop_file_edits() {
        use filetime::FileTime;

        let dir = tempdir().expect("Failed to create temp dir");
        let app_dir = make_app_dir(dir.path());
        fs::write(app_dir.join(".DirIcon"), b"icon-bytes").unwrap();
        fs::write(app_dir.join("example.desktop"), "[Desktop Entry]\nIcon=example\n").unwrap();
        let base = FileTime::from_unix_time(1_600_000_000, 0);
        for entry in [".DirIcon", "AppRun", "example.desktop", ""] {
            filetime::set_file_mtime(app_dir.join(entry), base).unwrap();
        }
        let before = AppDirBundle::open(&app_dir).unwrap().modified();
        assert_eq!(before.timestamp(), 1_600_000_000);

        filetime::set_file_mtime(app_dir.join(".DirIcon"), FileTime::from_unix_time(1_600_000_100, 0))
            .unwrap();
        assert_eq!(AppDirBundle::open(&app_dir).unwrap().modified().timestamp(), 1_600_000_100);

        filetime::set_file_mtime(
            app_dir.join("example.desktop"),
            FileTime::from_unix_time(1_600_000_200, 0),
        )
        .unwrap();
        assert_eq!(AppDirBundle::open(&app_dir).unwrap().modified().timestamp(), 1_600_000_200);
    }

    #[cfg(unix)]
    #[test]
    fn test_app_dir_bundle_mtime_follows_symlinked_dir_icon() {
        use filetime::FileTime;

        let dir = tempdir().expect("Failed to create temp dir");
        let app_dir = make_app_dir(dir.path());
        let target = app_dir.join("example.png");
        fs::write(&target, b"icon-bytes").unwrap();
        std::os::unix::fs::symlink("example.png", app_dir.join(".DirIcon")).unwrap();
        let base = FileTime::from_unix_time(1_600_000_000, 0);
        for entry in ["AppRun", "example.png", ""] {
            filetime::set_file_mtime(app_dir.join(entry), base).unwrap();
        }

        filetime::set_file_mtime(&target, FileTime::from_unix_time(1_600_000_300, 0)).unwrap();

        assert_eq!(AppDirBundle::open(&app_dir).unwrap().modified().timestamp(), 1_600_000_300);
    }

    #[test]
    fn test_app_dir_bundle_without_app_run_fails_resolution() {
        let dir = tempdir().expect("Failed to create temp dir");
        let app_dir = dir.path().join("Broken.AppDir");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(app_dir.join(".DirIcon"), b"icon-bytes").unwrap();

        let bundle = AppDirBundle::open(&app_dir).expect("Failed to open bundle");

        assert!(!AppDirBundle::is_app_dir(&app_dir));
        assert!(bundle.dir_icon().is_err());
    }

    #[test]
    fn test_app_dir_bundle_rejects_plain_file() {
        let dir = tempdir().expect("Failed to create temp dir");
        let file = dir.path().join("App.AppImage");
        fs::write(&file, b"not a directory").unwrap();

        assert!(AppDirBundle::open(&file).is_err());
    }
}
