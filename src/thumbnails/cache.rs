use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::error::{Result, ThumbnailError};

const TEMP_PREFIX: &str = ".appthumb-";
const TEMP_SUFFIX: &str = ".png.tmp";

/// Temp files older than this are leftovers from an interrupted run.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 5);

/// Publish `png` at `target`.
///
/// The data is written to a temporary file next to `target`, stamped with the
/// bundle's mtime, restricted to the owner and renamed into place, so readers
/// only ever see the previous thumbnail or the complete new one.
pub fn publish(png: &[u8], target: &Path, modified: DateTime<Utc>) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| ThumbnailError::publication(target, "Thumbnail path has no parent directory"))?;
    ensure_dir(dir).map_err(|e| ThumbnailError::publication(dir, e))?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| {
            ThumbnailError::publication(dir, format!("Failed to create temporary file: {}", e))
        })?;

    temp.write_all(png)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| {
            ThumbnailError::publication(temp.path(), format!("Failed to write thumbnail: {}", e))
        })?;

    let mtime = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
    filetime::set_file_times(temp.path(), FileTime::now(), mtime).map_err(|e| {
        ThumbnailError::publication(
            temp.path(),
            format!("Failed to set modification time: {}", e),
        )
    })?;

    if let Err(e) = restrict_permissions(temp.path()) {
        log::warn!(
            "Failed to restrict permissions of {}: {}",
            target.display(),
            e
        );
    }

    temp.persist(target).map_err(|e| {
        ThumbnailError::publication(
            target,
            format!("Failed to move thumbnail into place: {}", e.error),
        )
    })?;

    Ok(())
}

fn ensure_dir(dir: &Path) -> std::result::Result<(), String> {
    #[cfg(unix)]
    let created = {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    };

    #[cfg(not(unix))]
    let created = fs::create_dir_all(dir);

    created.map_err(|e| format!("Failed to create thumbnail directory: {}", e))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Remove temp files left behind by interrupted runs. Returns how many were removed.
pub fn prune_stale_temp_files(dir: &Path, max_age: Duration) -> std::result::Result<usize, String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(format!("Failed to read thumbnail directory: {}", e)),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| format!("Failed to read directory entry: {}", e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(TEMP_PREFIX) || !name.ends_with(TEMP_SUFFIX) {
            continue;
        }

        // The mtime is the bundle's, so age is measured from the last change
        let age = entry
            .metadata()
            .ok()
            .and_then(|m| changed_at(&m))
            .and_then(|changed| SystemTime::now().duration_since(changed).ok());
        if age.is_some_and(|age| age > max_age) && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }

    if removed > 0 {
        log::info!("Removed {} stale temporary thumbnails from {}", removed, dir.display());
    }
    Ok(removed)
}

#[cfg(unix)]
fn changed_at(metadata: &fs::Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;
    let secs = u64::try_from(metadata.ctime()).ok()?;
    let nanos = u32::try_from(metadata.ctime_nsec()).ok()?;
    Some(SystemTime::UNIX_EPOCH + Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn changed_at(metadata: &fs::Metadata) -> Option<SystemTime> {
    metadata.created().ok()
}
