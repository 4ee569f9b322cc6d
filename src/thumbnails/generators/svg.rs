use image::{DynamicImage, ImageFormat, RgbaImage};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Cursor;

/// Upper bound on either side of the rasterized canvas.
pub const MAX_RASTER_DIMENSION: u32 = 4096;

pub struct SvgRasterizer;

impl SvgRasterizer {
    /// Render an SVG document to a PNG the size of its `viewBox`, or of its
    /// `width`/`height` when it has none.
    pub fn rasterize(svg_data: &[u8]) -> Result<Vec<u8>, String> {
        // Parse SVG using resvg/usvg (gzip-compressed input is handled too)
        let opt = resvg::usvg::Options::default();
        let tree = resvg::usvg::Tree::from_data(svg_data, &opt)
            .map_err(|e| format!("SVG parse error: {:?}", e))?;

        let size = tree.size();
        let (target_w, target_h) = root_view_box(svg_data).unwrap_or((size.width(), size.height()));
        let (width, height) = Self::canvas_size(target_w, target_h)?;

        let mut pixmap = resvg::tiny_skia::Pixmap::new(width, height)
            .ok_or_else(|| "Failed to allocate pixmap".to_string())?;
        let transform = resvg::tiny_skia::Transform::from_scale(
            width as f32 / size.width(),
            height as f32 / size.height(),
        );
        let mut pmut = pixmap.as_mut();
        resvg::render(&tree, transform, &mut pmut);

        let rgba = unpremultiply(pixmap.data());
        let img = RgbaImage::from_raw(width, height, rgba)
            .ok_or_else(|| "Failed to create image buffer".to_string())?;

        let mut buffer = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .map_err(|e| format!("Failed to encode PNG: {}", e))?;
        Ok(buffer)
    }

    fn canvas_size(width: f32, height: f32) -> Result<(u32, u32), String> {
        let (w, h) = (width.round(), height.round());
        if !(w >= 1.0 && h >= 1.0) {
            return Err(format!("Invalid SVG dimensions {}x{}", width, height));
        }
        if w > MAX_RASTER_DIMENSION as f32 || h > MAX_RASTER_DIMENSION as f32 {
            return Err(format!(
                "SVG dimensions {}x{} exceed {}px",
                w, h, MAX_RASTER_DIMENSION
            ));
        }
        Ok((w as u32, h as u32))
    }
}

/// Width and height of the root element's `viewBox`, if it declares a usable one.
fn root_view_box(svg_data: &[u8]) -> Option<(f32, f32)> {
    let decompressed;
    let xml = if svg_data.starts_with(&[0x1f, 0x8b]) {
        decompressed = resvg::usvg::decompress_svgz(svg_data).ok()?;
        decompressed.as_slice()
    } else {
        svg_data
    };

    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() != b"svg" {
                    return None;
                }
                let attr = e
                    .attributes()
                    .flatten()
                    .find(|a| a.key.as_ref() == b"viewBox")?;
                return parse_view_box(&String::from_utf8_lossy(&attr.value));
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// `min-x min-y width height`, separated by whitespace and/or commas.
fn parse_view_box(value: &str) -> Option<(f32, f32)> {
    let numbers: Vec<f32> = value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect::<Option<_>>()?;
    match numbers[..] {
        [_, _, w, h] if w > 0.0 && h > 0.0 => Some((w, h)),
        _ => None,
    }
}

/// Convert tiny-skia's premultiplied RGBA to straight RGBA.
fn unpremultiply(data: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(data.len());
    for px in data.chunks_exact(4) {
        let r = px[0] as u32;
        let g = px[1] as u32;
        let b = px[2] as u32;
        let a = px[3] as u32;
        if a == 0 {
            rgba.extend_from_slice(&[0, 0, 0, 0]);
        } else {
            let ur = ((r * 255 + a / 2) / a).min(255) as u8;
            let ug = ((g * 255 + a / 2) / a).min(255) as u8;
            let ub = ((b * 255 + a / 2) / a).min(255) as u8;
            rgba.extend_from_slice(&[ur, ug, ub, a as u8]);
        }
    }
    rgba
}
