use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bundle::Bundle;
use crate::error::Result;
use crate::icon_theme::IconLookup;

pub mod cache;
pub mod generators;
pub mod metadata;
pub mod worker;

use metadata::MetadataScan;

/// Only the `normal` (128px) size class is produced.
pub const THUMBNAIL_SIZE_DIR: &str = "normal";

pub const KEY_URI: &str = "Thumb::URI";
pub const KEY_MTIME: &str = "Thumb::MTime";

/// `<cache_home>/thumbnails/normal`
pub fn thumbnail_dir(cache_home: &Path) -> PathBuf {
    cache_home.join("thumbnails").join(THUMBNAIL_SIZE_DIR)
}

/// Lowercase hex MD5 of the canonical URI, plus `.png`.
pub fn thumbnail_file_name(uri: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(uri.as_bytes());
    format!("{:x}.png", hasher.finalize())
}

/// `Thumb::MTime` representation: whole seconds since the Unix epoch.
pub fn mtime_string(modified: &DateTime<Utc>) -> String {
    modified.timestamp().to_string()
}

/// Runs the thumbnail pipeline for one bundle at a time:
/// resolve icon, rasterize if needed, embed provenance, publish.
pub struct Thumbnailer {
    thumbnail_dir: PathBuf,
    icon_lookup: Arc<dyn IconLookup>,
}

impl Thumbnailer {
    pub fn new(cache_home: &Path, icon_lookup: Arc<dyn IconLookup>) -> Self {
        Thumbnailer {
            thumbnail_dir: thumbnail_dir(cache_home),
            icon_lookup,
        }
    }

    pub fn thumbnail_dir(&self) -> &Path {
        &self.thumbnail_dir
    }

    pub fn thumbnail_path_for(&self, uri: &str) -> PathBuf {
        self.thumbnail_dir.join(thumbnail_file_name(uri))
    }

    /// Produce and publish the thumbnail for `bundle`, returning its path.
    ///
    /// Fails only when even the generic icon cannot be resolved or when
    /// publication fails; nothing is written in either case.
    pub fn produce(&self, bundle: &dyn Bundle) -> Result<PathBuf> {
        let icon = generators::resolve_icon(bundle, self.icon_lookup.as_ref())?;
        let modified = bundle.modified();

        let png = metadata::embed_provenance(
            icon.into_bytes(),
            bundle.canonical_uri(),
            &modified,
            bundle.path(),
        );

        let target = self.thumbnail_path_for(bundle.canonical_uri());
        log::debug!(
            "Creating thumbnail {} for {}",
            target.display(),
            bundle.path().display()
        );
        cache::publish(&png, &target, modified)?;

        Ok(target)
    }

    /// Whether the published thumbnail already records this bundle's URI and mtime.
    pub fn is_current(&self, bundle: &dyn Bundle) -> bool {
        let path = self.thumbnail_path_for(bundle.canonical_uri());
        let Ok(data) = fs::read(&path) else {
            return false;
        };

        match metadata::read_metadata(&data) {
            MetadataScan::Present(fields) => {
                fields.get(KEY_URI) == Some(bundle.canonical_uri())
                    && fields.get(KEY_MTIME) == Some(mtime_string(&bundle.modified()).as_str())
            }
            MetadataScan::Absent => false,
            MetadataScan::Malformed(reason) => {
                log::warn!("Thumbnail {} is unreadable: {}", path.display(), reason);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_thumbnail_file_name_is_md5_of_uri() {
        assert_eq!(
            thumbnail_file_name("file:///home/jens/photo/me.png"),
            "d40775e596682f2a16d1b834c221c0a2.png"
        );
        assert_eq!(
            thumbnail_file_name("file:///home/u/App.AppImage"),
            "892460ac2a3a8eab39d712921832a700.png"
        );
    }

    #[test]
    fn test_thumbnail_dir_is_normal_size_class() {
        let dir = thumbnail_dir(Path::new("/home/u/.cache"));
        assert_eq!(dir, PathBuf::from("/home/u/.cache/thumbnails/normal"));
    }

    #[test]
    fn test_mtime_string_is_whole_seconds() {
        let modified = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(mtime_string(&modified), "1622505600");

        let with_nanos = modified + chrono::Duration::milliseconds(999);
        assert_eq!(mtime_string(&with_nanos), "1622505600");
    }
}
