use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::bundle::AppDirBundle;
use crate::config::{CliArgs, DaemonConfig};
use crate::error::{Result, ThumbnailError};
use crate::fs_watcher::BundleWatcher;
use crate::icon_theme::XdgIconLookup;
use crate::thumbnails::cache::{self, STALE_TEMP_AGE};
use crate::thumbnails::worker::ThumbnailWorker;
use crate::thumbnails::Thumbnailer;

/// Run the daemon until interrupted, or until the named bundles are done
/// with `--once`. Returns how many named bundles could not be thumbnailed.
pub async fn serve(config: &DaemonConfig, args: &CliArgs) -> Result<usize> {
    let cache_home = config.cache_home()?;
    let thumbnailer = Arc::new(Thumbnailer::new(
        &cache_home,
        Arc::new(XdgIconLookup::new(config.icon_dirs.clone())),
    ));

    if let Err(e) = cache::prune_stale_temp_files(thumbnailer.thumbnail_dir(), STALE_TEMP_AGE) {
        log::warn!("Failed to clean thumbnail directory: {}", e);
    }

    let worker = Arc::new(ThumbnailWorker::new(thumbnailer.clone(), config.max_concurrent()).await?);

    let failed = thumbnail_named(&worker, &args.bundles).await;
    if args.once {
        shutdown(worker).await;
        return Ok(failed);
    }

    let (change_tx, mut change_rx) = mpsc::unbounded_channel::<PathBuf>();
    let watcher = BundleWatcher::new(Arc::new(move |root| {
        let _ = change_tx.send(root);
    }));

    for dir in &config.watch_dirs {
        if let Err(e) = watcher.start_watching(dir) {
            log::warn!("Not watching {}: {}", dir.display(), e);
            continue;
        }
        for bundle in stale_bundles(&thumbnailer, dir) {
            worker.submit_detached(Arc::new(bundle));
        }
    }

    if watcher.get_watched_paths().is_empty() {
        log::warn!("No bundle directories are being watched");
    }

    loop {
        tokio::select! {
            Some(root) = change_rx.recv() => {
                if let Some(bundle) = open_if_stale(&thumbnailer, &root) {
                    worker.submit_detached(Arc::new(bundle));
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::error!("Failed to listen for interrupt: {}", e);
                }
                break;
            }
        }
    }

    log::info!("Shutting down");
    watcher.stop_all_watchers();
    shutdown(worker).await;
    Ok(failed)
}

/// Bundles named on the command line are always regenerated.
async fn thumbnail_named(worker: &Arc<ThumbnailWorker>, paths: &[PathBuf]) -> usize {
    let mut jobs = JoinSet::new();
    let mut failed = 0;

    for path in paths {
        let bundle = match AppDirBundle::open(path) {
            Ok(bundle) => bundle,
            Err(e) => {
                log::error!("Skipping {}: {}", path.display(), e);
                failed += 1;
                continue;
            }
        };
        let worker = worker.clone();
        jobs.spawn(async move { worker.submit(Arc::new(bundle)).await });
    }

    while let Some(joined) = jobs.join_next().await {
        let result = joined
            .map_err(|e| ThumbnailError::Worker(e.to_string()))
            .and_then(|result| result);
        if let Err(e) = result {
            log::error!("{}", e);
            failed += 1;
        }
    }

    failed
}

async fn shutdown(worker: Arc<ThumbnailWorker>) {
    match Arc::try_unwrap(worker) {
        Ok(worker) => worker.shutdown().await,
        Err(_) => log::warn!("Thumbnail worker still in use at shutdown"),
    }
}

/// Application directories directly under `dir` whose thumbnail is missing or outdated.
pub fn stale_bundles(thumbnailer: &Thumbnailer, dir: &Path) -> Vec<AppDirBundle> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Failed to scan {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut roots: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    roots.sort();

    roots
        .iter()
        .filter_map(|root| open_if_stale(thumbnailer, root))
        .collect()
}

fn open_if_stale(thumbnailer: &Thumbnailer, root: &Path) -> Option<AppDirBundle> {
    if !AppDirBundle::is_app_dir(root) {
        return None;
    }

    match AppDirBundle::open(root) {
        Ok(bundle) if thumbnailer.is_current(&bundle) => {
            log::debug!("Thumbnail for {} is current", root.display());
            None
        }
        Ok(bundle) => Some(bundle),
        Err(e) => {
            log::warn!("Skipping {}: {}", root.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn red_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(16, 16, image::Rgba([255, 0, 0, 255]));
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, image::ImageFormat::Png)
            .expect("Failed to encode PNG");
        buffer.into_inner()
    }

    fn make_app_dir(root: &Path, name: &str) -> PathBuf {
        let app_dir = root.join(name);
        fs::create_dir_all(&app_dir).expect("Failed to create AppDir");
        fs::write(app_dir.join("AppRun"), b"#!/bin/sh\n").expect("Failed to write AppRun");
        fs::write(app_dir.join(".DirIcon"), red_png()).expect("Failed to write .DirIcon");
        app_dir
    }

    fn test_config(cache_home: &Path) -> DaemonConfig {
        DaemonConfig {
            cache_home: Some(cache_home.to_path_buf()),
            watch_dirs: Vec::new(),
            icon_dirs: Vec::new(),
            max_concurrent: Some(2),
            verbose: false,
        }
    }

    #[test]
    fn test_stale_bundles_skips_current_and_non_bundles() {
        let apps = tempdir().expect("Failed to create temp dir");
        let cache_home = tempdir().expect("Failed to create temp dir");
        let first = make_app_dir(apps.path(), "First.AppDir");
        make_app_dir(apps.path(), "Second.AppDir");
        fs::create_dir_all(apps.path().join("NotAnApp")).unwrap();
        fs::write(apps.path().join("notes.txt"), b"x").unwrap();

        let thumbnailer = Thumbnailer::new(
            cache_home.path(),
            Arc::new(XdgIconLookup::with_data_dirs(Vec::new())),
        );
        let current = AppDirBundle::open(&first).unwrap();
        thumbnailer.produce(&current).expect("Failed to produce thumbnail");

        let stale = stale_bundles(&thumbnailer, apps.path());

        assert_eq!(stale.len(), 1);
        assert!(stale[0].path().ends_with("Second.AppDir"));
    }

    #[test]
    fn test_in_place_icon_edit_makes_thumbnail_stale() {
        use filetime::FileTime;

        let apps = tempdir().expect("Failed to create temp dir");
        let cache_home = tempdir().expect("Failed to create temp dir");
        let app_dir = make_app_dir(apps.path(), "Edited.AppDir");
        let base = FileTime::from_unix_time(1_600_000_000, 0);
        for entry in [".DirIcon", "AppRun", ""] {
            filetime::set_file_mtime(app_dir.join(entry), base).unwrap();
        }

        let thumbnailer = Thumbnailer::new(
            cache_home.path(),
            Arc::new(XdgIconLookup::with_data_dirs(Vec::new())),
        );
        let bundle = AppDirBundle::open(&app_dir).unwrap();
        thumbnailer.produce(&bundle).expect("Failed to produce thumbnail");
        assert!(open_if_stale(&thumbnailer, &app_dir).is_none());

        // Rewriting the icon leaves the directory mtime alone
        fs::write(app_dir.join(".DirIcon"), red_png()).unwrap();
        filetime::set_file_mtime(app_dir.join(".DirIcon"), FileTime::from_unix_time(1_600_000_500, 0))
            .unwrap();
        filetime::set_file_mtime(&app_dir, base).unwrap();

        let reopened = AppDirBundle::open(&app_dir).unwrap();
        assert!(!thumbnailer.is_current(&reopened));
        assert!(open_if_stale(&thumbnailer, &app_dir).is_some());
    }

    #[test]
    fn test_stale_bundles_missing_directory_is_empty() {
        let cache_home = tempdir().expect("Failed to create temp dir");
        let thumbnailer = Thumbnailer::new(
            cache_home.path(),
            Arc::new(XdgIconLookup::with_data_dirs(Vec::new())),
        );

        assert!(stale_bundles(&thumbnailer, &cache_home.path().join("missing")).is_empty());
    }

    #[tokio::test]
    async fn test_serve_once_thumbnails_named_bundles() {
        let apps = tempdir().expect("Failed to create temp dir");
        let cache_home = tempdir().expect("Failed to create temp dir");
        let app_dir = make_app_dir(apps.path(), "Named.AppDir");
        let args = CliArgs {
            once: true,
            bundles: vec![app_dir.clone(), apps.path().join("Missing.AppDir")],
            ..CliArgs::default()
        };

        let failed = serve(&test_config(cache_home.path()), &args)
            .await
            .expect("Failed to run daemon");

        assert_eq!(failed, 1);
        let bundle = AppDirBundle::open(&app_dir).unwrap();
        let thumbnailer = Thumbnailer::new(
            cache_home.path(),
            Arc::new(XdgIconLookup::with_data_dirs(Vec::new())),
        );
        assert!(thumbnailer.thumbnail_path_for(bundle.canonical_uri()).exists());
        assert!(thumbnailer.is_current(&bundle));
    }
}
