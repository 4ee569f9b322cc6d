use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;

use crate::bundle::Bundle;
use crate::error::{Result, ThumbnailError};
use crate::icon_theme::IconLookup;

pub mod generic;
pub mod svg;

use svg::SvgRasterizer;

const PNG_SIGNATURE: [u8; 8] = *b"\x89PNG\r\n\x1a\n";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// How much of a buffer is inspected when looking for an `<svg` root.
const SNIFF_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconKind {
    Png,
    Svg,
    /// Some other raster format, converted to PNG before use.
    OtherRaster,
}

/// Icon data held for the duration of one run.
#[derive(Debug, Clone)]
pub struct IconBytes {
    data: Vec<u8>,
    kind: IconKind,
}

impl IconBytes {
    /// Classify `data` by its content, never by a file name.
    pub fn sniff(data: Vec<u8>) -> Self {
        let kind = if data.starts_with(&PNG_SIGNATURE) {
            IconKind::Png
        } else if is_vector(&data) {
            IconKind::Svg
        } else {
            IconKind::OtherRaster
        };
        IconBytes { data, kind }
    }

    pub fn kind(&self) -> IconKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Whether `data` is an SVG document (or gzip-compressed SVGZ).
pub fn is_vector(data: &[u8]) -> bool {
    if data.starts_with(&GZIP_MAGIC) {
        return true;
    }

    let head = String::from_utf8_lossy(&data[..data.len().min(SNIFF_LEN)]);
    let mut rest = head.trim_start_matches('\u{feff}').trim_start();

    loop {
        if let Some(after) = rest.strip_prefix("<?") {
            let Some(end) = after.find("?>") else {
                return false;
            };
            rest = after[end + 2..].trim_start();
        } else if let Some(after) = rest.strip_prefix("<!--") {
            let Some(end) = after.find("-->") else {
                return false;
            };
            rest = after[end + 3..].trim_start();
        } else if rest
            .get(..9)
            .is_some_and(|p| p.eq_ignore_ascii_case("<!doctype"))
        {
            let Some(after) = skip_doctype(&rest[9..]) else {
                return false;
            };
            rest = after.trim_start();
        } else {
            break;
        }
    }

    rest.starts_with("<svg")
        && rest[4..]
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '>' || c == '/' || c == ':')
}

fn skip_doctype(after: &str) -> Option<&str> {
    let gt = after.find('>')?;
    match after.find('[') {
        Some(open) if open < gt => {
            let close = after[open..].find(']')? + open;
            let gt = after[close..].find('>')? + close;
            Some(&after[gt + 1..])
        }
        _ => Some(&after[gt + 1..]),
    }
}

/// One level of the icon fallback chain.
pub struct IconStrategy {
    pub name: &'static str,
    pub resolve: fn(&dyn Bundle, &dyn IconLookup) -> std::result::Result<Vec<u8>, String>,
}

/// Embedded icon, then the desktop file's icon, then the generic icon.
pub const ICON_STRATEGIES: &[IconStrategy] = &[
    IconStrategy {
        name: "embedded icon",
        resolve: dir_icon,
    },
    IconStrategy {
        name: "desktop file icon",
        resolve: desktop_icon,
    },
    IconStrategy {
        name: "generic icon",
        resolve: generic::resolve,
    },
];

fn dir_icon(bundle: &dyn Bundle, _lookup: &dyn IconLookup) -> std::result::Result<Vec<u8>, String> {
    bundle.dir_icon()
}

fn desktop_icon(bundle: &dyn Bundle, lookup: &dyn IconLookup) -> std::result::Result<Vec<u8>, String> {
    let name = bundle
        .desktop_icon_name()
        .ok_or_else(|| "Bundle declares no desktop icon".to_string())?;
    lookup.lookup(&name)
}

/// Resolve a PNG icon for `bundle` through [`ICON_STRATEGIES`].
pub fn resolve_icon(bundle: &dyn Bundle, lookup: &dyn IconLookup) -> Result<IconBytes> {
    resolve_with(ICON_STRATEGIES, bundle, lookup)
}

/// Try each strategy in order; the first candidate that normalizes to a PNG wins.
pub fn resolve_with(
    strategies: &[IconStrategy],
    bundle: &dyn Bundle,
    lookup: &dyn IconLookup,
) -> Result<IconBytes> {
    let mut last_error = None;

    for (level, strategy) in strategies.iter().enumerate() {
        if level > 0 {
            log::info!(
                "Falling back to {} for {}",
                strategy.name,
                bundle.path().display()
            );
        }

        let candidate = match (strategy.resolve)(bundle, lookup) {
            Ok(data) => data,
            Err(reason) => {
                log::debug!(
                    "No {} for {}: {}",
                    strategy.name,
                    bundle.path().display(),
                    reason
                );
                last_error = Some(ThumbnailError::Resolution {
                    strategy: strategy.name,
                    reason,
                });
                continue;
            }
        };

        match normalize(strategy.name, candidate, bundle) {
            Ok(icon) => return Ok(icon),
            Err(err) => {
                log::warn!("Skipping {} for {}: {}", strategy.name, bundle.path().display(), err);
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or(ThumbnailError::Resolution {
        strategy: "icon resolver",
        reason: "No icon sources configured".to_string(),
    }))
}

/// Turn a candidate into a non-empty PNG, rasterizing or transcoding as needed.
fn normalize(strategy: &'static str, data: Vec<u8>, bundle: &dyn Bundle) -> Result<IconBytes> {
    let resolution_failure = |reason: String| ThumbnailError::Resolution { strategy, reason };

    if data.is_empty() {
        return Err(resolution_failure("Empty icon stream".to_string()));
    }

    let icon = IconBytes::sniff(data);
    match icon.kind() {
        IconKind::Png => {
            let (width, height) = image::load_from_memory_with_format(icon.as_bytes(), ImageFormat::Png)
                .map_err(|e| resolution_failure(format!("Failed to decode PNG: {}", e)))?
                .dimensions();
            if width == 0 || height == 0 {
                return Err(resolution_failure("Invalid image dimensions".to_string()));
            }
            Ok(icon)
        }
        IconKind::Svg => {
            log::warn!(
                "The {} of {} is an SVG, this is discouraged. Converting it now",
                strategy,
                bundle.path().display()
            );
            SvgRasterizer::rasterize(icon.as_bytes())
                .map(IconBytes::sniff)
                .map_err(ThumbnailError::Conversion)
        }
        IconKind::OtherRaster => {
            let image = image::load_from_memory(icon.as_bytes())
                .map_err(|e| resolution_failure(format!("Unrecognized icon format: {}", e)))?;
            let (width, height) = image.dimensions();
            log::debug!(
                "Transcoding {}x{} {} of {} to PNG",
                width,
                height,
                strategy,
                bundle.path().display()
            );
            encode_png(&image).map(IconBytes::sniff).map_err(resolution_failure)
        }
    }
}

fn encode_png(image: &DynamicImage) -> std::result::Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| format!("Failed to encode PNG: {}", e))?;
    Ok(buffer)
}
