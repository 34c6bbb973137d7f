//! QR rendering for invite and lookup codes. The payload is the bare code.

use std::path::Path;

use qrcode::QrCode;
use qrcode::render::{svg, unicode};

use crate::AppError;

fn encode(code: &str) -> Result<QrCode, AppError> {
    QrCode::new(code.as_bytes()).map_err(|e| AppError::Qr(e.to_string()))
}

/// Half-block rendering for terminals, light modules on dark.
pub fn render_terminal(code: &str) -> Result<String, AppError> {
    Ok(encode(code)?
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

pub fn render_svg(code: &str) -> Result<String, AppError> {
    Ok(encode(code)?
        .render::<svg::Color>()
        .min_dimensions(512, 512)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

pub fn write_svg(code: &str, path: &Path) -> Result<(), AppError> {
    std::fs::write(path, render_svg(code)?)?;
    Ok(())
}
