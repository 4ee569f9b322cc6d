use image::ImageFormat;
use once_cell::sync::Lazy;

use crate::bundle::Bundle;
use crate::icon_theme::IconLookup;

static GENERIC_ICON_PNG: &[u8] = include_bytes!("../../../assets/generic-icon.png");

/// The compiled-in generic icon, validated on first use and never mutated.
static GENERIC_ICON: Lazy<Result<&'static [u8], String>> = Lazy::new(|| {
    image::load_from_memory_with_format(GENERIC_ICON_PNG, ImageFormat::Png)
        .map(|_| GENERIC_ICON_PNG)
        .map_err(|e| format!("Bundled generic icon is not a valid PNG: {}", e))
});

pub fn generic_icon() -> Result<&'static [u8], String> {
    GENERIC_ICON.clone()
}

pub fn resolve(_bundle: &dyn Bundle, _lookup: &dyn IconLookup) -> Result<Vec<u8>, String> {
    generic_icon().map(<[u8]>::to_vec)
}
