//! Pairing code rendering.

use qrcode::QrCode;
use qrcode::render::svg;

const SVG_DATA_URL_PREFIX: &str = "data:image/svg+xml;base64,";

/// A pairing code rendered as a scannable SVG image.
#[derive(Debug, Clone)]
pub struct PairingImage {
    /// Base64 of the SVG document
    pub base64: String,
    /// The same image as a `data:` URL, ready for an `<img src>`
    pub data_url: String,
}

/// Render `code` as a QR code SVG.
pub fn render_pairing_image(code: &str) -> Result<PairingImage, qrcode::types::QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    let image = qr
        .render::<svg::Color>()
        .quiet_zone(true)
        .min_dimensions(256, 256)
        .build();

    let base64 = data_encoding::BASE64.encode(image.as_bytes());
    let data_url = format!("{}{}", SVG_DATA_URL_PREFIX, base64);
    Ok(PairingImage { base64, data_url })
}
