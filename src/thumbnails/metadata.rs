//! Thumbnail attributes stored as PNG text chunks.
//!
//! Keys are always overwritten: every text chunk carrying a key is removed
//! before the new value is written, so a stale `Thumb::URI` copied from an
//! unrelated source icon can never survive next to the current one.

use chrono::{DateTime, Utc};
use img_parts::png::{Png, PngChunk};
use img_parts::Bytes;
use std::collections::BTreeMap;
use std::path::Path;

use super::{mtime_string, KEY_MTIME, KEY_URI};
use crate::error::ThumbnailError;

const CHUNK_IHDR: [u8; 4] = *b"IHDR";
const CHUNK_IEND: [u8; 4] = *b"IEND";
const CHUNK_TEXT: [u8; 4] = *b"tEXt";
const CHUNK_ZTXT: [u8; 4] = *b"zTXt";
const CHUNK_ITXT: [u8; 4] = *b"iTXt";

const MAX_KEYWORD_LEN: usize = 79;

/// Text fields found in (or destined for) a PNG.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThumbnailMetadata {
    fields: BTreeMap<String, String>,
}

impl ThumbnailMetadata {
    /// The two provenance fields for a bundle.
    pub fn provenance(uri: &str, modified: &DateTime<Utc>) -> Self {
        let mut metadata = ThumbnailMetadata::default();
        metadata.insert(KEY_URI, uri);
        metadata.insert(KEY_MTIME, &mtime_string(modified));
        metadata
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.fields.insert(key.to_string(), value.to_string());
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Result of scanning a buffer for text metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataScan {
    Present(ThumbnailMetadata),
    /// A valid PNG without text chunks; the normal state of a fresh icon.
    Absent,
    /// Not a PNG, or a text chunk that cannot be decoded.
    Malformed(String),
}

pub fn read_metadata(data: &[u8]) -> MetadataScan {
    let png = match Png::from_bytes(Bytes::copy_from_slice(data)) {
        Ok(png) => png,
        Err(e) => return MetadataScan::Malformed(format!("Failed to parse PNG: {}", e)),
    };

    let mut fields = ThumbnailMetadata::default();
    for chunk in png.chunks() {
        match decode_text_chunk(chunk) {
            Some(Ok((key, value))) => fields.insert(&key, &value),
            Some(Err(reason)) => return MetadataScan::Malformed(reason),
            None => {}
        }
    }

    if fields.is_empty() {
        MetadataScan::Absent
    } else {
        MetadataScan::Present(fields)
    }
}

/// Write one text field, replacing any existing chunk with the same keyword.
///
/// Latin-1 values are stored in `tEXt`, anything else in an uncompressed
/// `iTXt`. The new chunk goes right before `IEND`; image data is untouched.
pub fn embed_field(data: &[u8], key: &str, value: &str) -> Result<Vec<u8>, String> {
    let keyword = encode_keyword(key)?;
    if value.contains('\0') {
        return Err(format!("Value for {} contains a NUL byte", key));
    }

    let mut png = Png::from_bytes(Bytes::copy_from_slice(data))
        .map_err(|e| format!("Failed to parse PNG: {}", e))?;
    if png.chunk_by_type(CHUNK_IHDR).is_none() {
        return Err("PNG has no IHDR chunk".to_string());
    }

    png.chunks_mut()
        .retain(|chunk| text_keyword(chunk) != Some(keyword.as_slice()));

    let chunk = match latin1(value) {
        Some(text) => {
            let mut contents = keyword.clone();
            contents.push(0);
            contents.extend_from_slice(&text);
            PngChunk::new(CHUNK_TEXT, Bytes::from(contents))
        }
        None => {
            // keyword, NUL, compression flag, method, empty language tag and
            // translated keyword, then UTF-8 text
            let mut contents = keyword.clone();
            contents.extend_from_slice(&[0, 0, 0, 0, 0]);
            contents.extend_from_slice(value.as_bytes());
            PngChunk::new(CHUNK_ITXT, Bytes::from(contents))
        }
    };

    let iend = png
        .chunks()
        .iter()
        .position(|c| c.kind() == CHUNK_IEND)
        .unwrap_or(png.chunks().len());
    png.chunks_mut().insert(iend, chunk);

    let mut out = Vec::with_capacity(data.len() + key.len() + value.len() + 12);
    png.encoder()
        .write_to(&mut out)
        .map_err(|e| format!("Failed to encode PNG: {}", e))?;
    Ok(out)
}

/// Replace `Thumb::URI` and `Thumb::MTime` with the current bundle's values.
///
/// Each key is embedded independently; a key that fails is logged and the
/// buffer from before that step is kept.
pub fn embed_provenance(
    data: Vec<u8>,
    uri: &str,
    modified: &DateTime<Utc>,
    origin: &Path,
) -> Vec<u8> {
    let wanted = ThumbnailMetadata::provenance(uri, modified);

    match read_metadata(&data) {
        MetadataScan::Present(existing) => {
            for key in [KEY_URI, KEY_MTIME] {
                match (existing.get(key), wanted.get(key)) {
                    (Some(old), Some(new)) if old != new => log::info!(
                        "Discarding stale {} '{}' in icon for {}",
                        key,
                        old,
                        origin.display()
                    ),
                    (Some(_), _) => log::debug!(
                        "Rewriting existing {} in icon for {}",
                        key,
                        origin.display()
                    ),
                    _ => {}
                }
            }
        }
        MetadataScan::Absent => {}
        MetadataScan::Malformed(reason) => log::warn!(
            "Icon for {} has unreadable metadata: {}",
            origin.display(),
            reason
        ),
    }

    let mut png = data;
    for key in [KEY_URI, KEY_MTIME] {
        let Some(value) = wanted.get(key) else {
            continue;
        };
        match embed_field(&png, key, value) {
            Ok(updated) => png = updated,
            Err(reason) => {
                let err = ThumbnailError::Metadata {
                    key: key.to_string(),
                    reason,
                };
                log::warn!("Thumbnail for {}: {}", origin.display(), err);
            }
        }
    }
    png
}

fn decode_text_chunk(chunk: &PngChunk) -> Option<Result<(String, String), String>> {
    let kind = chunk.kind();
    if kind != CHUNK_TEXT && kind != CHUNK_ZTXT && kind != CHUNK_ITXT {
        return None;
    }

    let contents: &[u8] = chunk.contents();
    let Some(nul) = contents.iter().position(|&b| b == 0) else {
        return Some(Err(format!(
            "{} chunk without keyword separator",
            String::from_utf8_lossy(&kind)
        )));
    };
    let key = decode_latin1(&contents[..nul]);
    let rest = &contents[nul + 1..];

    let value = if kind == CHUNK_TEXT {
        decode_latin1(rest)
    } else if kind == CHUNK_ZTXT {
        // compressed values are only needed for their keyword
        String::new()
    } else {
        match decode_itxt_value(rest) {
            Ok(value) => value,
            Err(reason) => return Some(Err(format!("iTXt chunk '{}': {}", key, reason))),
        }
    };

    Some(Ok((key, value)))
}

fn decode_itxt_value(rest: &[u8]) -> Result<String, String> {
    let [compressed, _method, tail @ ..] = rest else {
        return Err("truncated header".to_string());
    };
    let language_end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or("missing language tag")?;
    let tail = &tail[language_end + 1..];
    let translated_end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or("missing translated keyword")?;
    let text = &tail[translated_end + 1..];

    if *compressed != 0 {
        return Ok(String::new());
    }
    String::from_utf8(text.to_vec()).map_err(|e| format!("invalid UTF-8: {}", e))
}

fn text_keyword(chunk: &PngChunk) -> Option<&[u8]> {
    let kind = chunk.kind();
    if kind != CHUNK_TEXT && kind != CHUNK_ZTXT && kind != CHUNK_ITXT {
        return None;
    }
    let contents: &[u8] = chunk.contents();
    let nul = contents.iter().position(|&b| b == 0)?;
    Some(&contents[..nul])
}

fn encode_keyword(key: &str) -> Result<Vec<u8>, String> {
    let keyword = latin1(key).ok_or_else(|| format!("Keyword {} is not Latin-1", key))?;
    if keyword.is_empty() || keyword.len() > MAX_KEYWORD_LEN {
        return Err(format!("Keyword {} must be 1-79 bytes", key));
    }
    if keyword.iter().any(|&b| !(32..=126).contains(&b) && b < 161) {
        return Err(format!("Keyword {} contains non-printable characters", key));
    }
    if keyword.first() == Some(&b' ') || keyword.last() == Some(&b' ') {
        return Err(format!("Keyword {} has leading or trailing spaces", key));
    }
    Ok(keyword)
}

fn latin1(s: &str) -> Option<Vec<u8>> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use std::io::Cursor;

    fn sample_png() -> Vec<u8> {
        let img = RgbaImage::from_pixel(4, 3, image::Rgba([10, 20, 30, 255]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .expect("Failed to encode PNG");
        buffer
    }

    fn sample_mtime() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap()
    }

    fn count_text_chunks(data: &[u8], key: &str) -> usize {
        let png = Png::from_bytes(Bytes::copy_from_slice(data)).unwrap();
        png.chunks()
            .iter()
            .filter(|c| text_keyword(c) == Some(key.as_bytes()))
            .count()
    }

    #[test]
    fn test_fresh_png_has_no_metadata() {
        assert_eq!(read_metadata(&sample_png()), MetadataScan::Absent);
    }

    #[test]
    fn test_non_png_is_malformed() {
        assert!(matches!(
            read_metadata(b"<svg xmlns=\"http://www.w3.org/2000/svg\"/>"),
            MetadataScan::Malformed(_)
        ));
    }

    #[test]
    fn test_embed_provenance_writes_both_keys() {
        let png = embed_provenance(
            sample_png(),
            "file:///home/u/App.AppImage",
            &sample_mtime(),
            Path::new("/home/u/App.AppImage"),
        );

        let MetadataScan::Present(fields) = read_metadata(&png) else {
            panic!("Expected metadata to be present");
        };
        assert_eq!(fields.get(KEY_URI), Some("file:///home/u/App.AppImage"));
        assert_eq!(fields.get(KEY_MTIME), Some("1622505600"));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_embed_replaces_stale_values_instead_of_appending() {
        let stale = embed_field(&sample_png(), KEY_URI, "file:///somewhere/else.png").unwrap();
        let stale = embed_field(&stale, KEY_MTIME, "1").unwrap();

        let png = embed_provenance(
            stale,
            "file:///home/u/App.AppImage",
            &sample_mtime(),
            Path::new("/home/u/App.AppImage"),
        );

        assert_eq!(count_text_chunks(&png, KEY_URI), 1);
        assert_eq!(count_text_chunks(&png, KEY_MTIME), 1);
        let MetadataScan::Present(fields) = read_metadata(&png) else {
            panic!("Expected metadata to be present");
        };
        assert_eq!(fields.get(KEY_URI), Some("file:///home/u/App.AppImage"));
        assert_eq!(fields.get(KEY_MTIME), Some("1622505600"));
    }

    #[test]
    fn test_embed_provenance_is_idempotent() {
        let origin = Path::new("/home/u/App.AppImage");
        let first = embed_provenance(sample_png(), "file:///home/u/App.AppImage", &sample_mtime(), origin);
        let second = embed_provenance(first.clone(), "file:///home/u/App.AppImage", &sample_mtime(), origin);

        assert_eq!(first, second);
    }

    #[test]
    fn test_embed_keeps_other_text_fields() {
        let png = embed_field(&sample_png(), "Software", "example").unwrap();
        let png = embed_field(&png, KEY_URI, "file:///a").unwrap();

        let MetadataScan::Present(fields) = read_metadata(&png) else {
            panic!("Expected metadata to be present");
        };
        assert_eq!(fields.get("Software"), Some("example"));
        assert_eq!(fields.get(KEY_URI), Some("file:///a"));
    }

    #[test]
    fn test_non_latin1_value_uses_itxt() {
        let png = embed_field(&sample_png(), KEY_URI, "file:///home/u/アプリ").unwrap();

        let parsed = Png::from_bytes(Bytes::copy_from_slice(&png)).unwrap();
        assert!(parsed.chunk_by_type(CHUNK_ITXT).is_some());
        assert!(parsed.chunk_by_type(CHUNK_TEXT).is_none());
        let MetadataScan::Present(fields) = read_metadata(&png) else {
            panic!("Expected metadata to be present");
        };
        assert_eq!(fields.get(KEY_URI), Some("file:///home/u/アプリ"));
    }

    #[test]
    fn test_embedding_preserves_pixels() {
        let original = sample_png();
        let png = embed_provenance(
            original.clone(),
            "file:///a",
            &sample_mtime(),
            Path::new("/a"),
        );

        let before = image::load_from_memory(&original).unwrap().to_rgba8();
        let after = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(before, after);
    }

    #[test]
    fn test_embed_field_rejects_bad_input() {
        assert!(embed_field(b"not a png", KEY_URI, "file:///a").is_err());
        assert!(embed_field(&sample_png(), "", "value").is_err());
        assert!(embed_field(&sample_png(), &"k".repeat(80), "value").is_err());
        assert!(embed_field(&sample_png(), KEY_URI, "a\0b").is_err());
    }

    #[test]
    fn test_failed_embedding_leaves_buffer_untouched() {
        let data = b"definitely not a png".to_vec();
        let out = embed_provenance(data.clone(), "file:///a", &sample_mtime(), Path::new("/a"));
        assert_eq!(out, data);
    }
}
