//! Content-based image type detection.
//!
//! Classification looks only at the leading signature bytes of a buffer. The URL
//! suffix and any `Content-Type` header the remote host sent are never consulted,
//! so a `.png` URL serving a GIF is reported as a GIF.

/// Extensions the migration accepts for re-upload.
pub const SUPPORTED_EXTENSIONS: [&str; 2] = ["jpg", "png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageType {
    pub ext: &'static str,
    pub mime: &'static str,
}

impl ImageType {
    const fn new(ext: &'static str, mime: &'static str) -> Self {
        Self { ext, mime }
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_EXTENSIONS.contains(&self.ext)
    }
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JP2_SIGNATURE: [u8; 12] = [
    0x00, 0x00, 0x00, 0x0C, b'j', b'P', b' ', b' ', 0x0D, 0x0A, 0x87, 0x0A,
];

fn check(buf: &[u8], offset: usize, sig: &[u8]) -> bool {
    buf.get(offset..offset + sig.len()) == Some(sig)
}

/// Classify `buf` by its magic-number prefix. Returns `None` when no known image
/// signature matches. Animated PNG, JPEG XL and Motion JPEG 2000 are not treated
/// as images and also yield `None`.
pub fn detect(buf: &[u8]) -> Option<ImageType> {
    if buf.len() < 2 {
        return None;
    }

    if check(buf, 0, &[0xFF, 0xD8, 0xFF]) {
        return Some(ImageType::new("jpg", "image/jpeg"));
    }
    if check(buf, 0, &PNG_SIGNATURE) {
        return png_unless_animated(buf);
    }
    if check(buf, 0, b"GIF") {
        return Some(ImageType::new("gif", "image/gif"));
    }
    if check(buf, 0, b"RIFF") && check(buf, 8, b"WEBP") {
        return Some(ImageType::new("webp", "image/webp"));
    }
    if check(buf, 0, b"FLIF") {
        return Some(ImageType::new("flif", "image/flif"));
    }
    if check(buf, 0, &[b'I', b'I', 0x2A, 0x00]) {
        if check(buf, 8, b"CR") {
            return Some(ImageType::new("cr2", "image/x-canon-cr2"));
        }
        return Some(ImageType::new("tif", "image/tiff"));
    }
    if check(buf, 0, &[b'M', b'M', 0x00, 0x2A]) {
        return Some(ImageType::new("tif", "image/tiff"));
    }
    if check(buf, 0, &[b'I', b'I', 0xBC]) {
        return Some(ImageType::new("jxr", "image/vnd.ms-photo"));
    }
    if check(buf, 0, b"8BPS") {
        return Some(ImageType::new("psd", "image/vnd.adobe.photoshop"));
    }
    if check(buf, 0, &[b'B', b'P', b'G', 0xFB]) {
        return Some(ImageType::new("bpg", "image/bpg"));
    }
    if check(buf, 0, &[0x00, 0x00, 0x01, 0x00]) {
        return Some(ImageType::new("ico", "image/x-icon"));
    }
    if check(buf, 0, &[0x00, 0x00, 0x02, 0x00]) {
        return Some(ImageType::new("cur", "image/x-icon"));
    }
    if check(buf, 0, &JP2_SIGNATURE) {
        return jpeg2000(buf);
    }
    if check(buf, 4, b"ftyp") {
        if let Some(t) = iso_bmff_image(buf) {
            return Some(t);
        }
    }
    if check(buf, 128, b"DICM") {
        return Some(ImageType::new("dcm", "application/dicom"));
    }
    // Checked last: two bytes is a weak signature.
    if check(buf, 0, b"BM") {
        return Some(ImageType::new("bmp", "image/bmp"));
    }

    None
}

/// A PNG stream carrying an `acTL` chunk ahead of its first `IDAT` is animated.
fn png_unless_animated(buf: &[u8]) -> Option<ImageType> {
    let png = Some(ImageType::new("png", "image/png"));
    let mut offset = PNG_SIGNATURE.len();
    while let Some(len_bytes) = buf.get(offset..offset + 4) {
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let Some(kind) = buf.get(offset + 4..offset + 8) else {
            break;
        };
        match kind {
            b"acTL" => return None,
            b"IDAT" => return png,
            _ => {}
        }
        // length + type + data + crc
        offset = match offset.checked_add(12 + len as usize) {
            Some(next) => next,
            None => break,
        };
    }
    png
}

fn jpeg2000(buf: &[u8]) -> Option<ImageType> {
    let brand = buf.get(20..24)?;
    match brand {
        b"jp2 " => Some(ImageType::new("jp2", "image/jp2")),
        b"jpx " => Some(ImageType::new("jpx", "image/jpx")),
        b"jpm " => Some(ImageType::new("jpm", "image/jpm")),
        _ => None,
    }
}

fn iso_bmff_image(buf: &[u8]) -> Option<ImageType> {
    let brand = buf.get(8..12)?;
    match brand {
        b"avif" | b"avis" => Some(ImageType::new("avif", "image/avif")),
        b"mif1" => Some(ImageType::new("heic", "image/heif")),
        b"msf1" => Some(ImageType::new("heic", "image/heif-sequence")),
        b"heic" | b"heix" => Some(ImageType::new("heic", "image/heic")),
        b"hevc" | b"hevx" => Some(ImageType::new("heic", "image/heic-sequence")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(data);
        out.extend_from_slice(&[0, 0, 0, 0]);
    }

    #[test]
    fn detects_jpeg_regardless_of_trailing_bytes() {
        let t = detect(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F']).unwrap();
        assert_eq!(t.ext, "jpg");
        assert_eq!(t.mime, "image/jpeg");
        assert!(t.is_supported());
    }

    #[test]
    fn detects_static_png() {
        let mut buf = PNG_SIGNATURE.to_vec();
        push_chunk(&mut buf, b"IHDR", &[0; 13]);
        push_chunk(&mut buf, b"IDAT", &[1, 2, 3]);
        let t = detect(&buf).unwrap();
        assert_eq!(t, ImageType::new("png", "image/png"));
        assert!(t.is_supported());
    }

    #[test]
    fn bare_png_signature_is_png() {
        assert_eq!(detect(&PNG_SIGNATURE).unwrap().ext, "png");
    }

    #[test]
    fn animated_png_is_not_an_image() {
        let mut buf = PNG_SIGNATURE.to_vec();
        push_chunk(&mut buf, b"IHDR", &[0; 13]);
        push_chunk(&mut buf, b"acTL", &[0; 8]);
        push_chunk(&mut buf, b"IDAT", &[1, 2, 3]);
        assert_eq!(detect(&buf), None);
    }

    #[test]
    fn actl_after_first_idat_stays_png() {
        let mut buf = PNG_SIGNATURE.to_vec();
        push_chunk(&mut buf, b"IHDR", &[0; 13]);
        push_chunk(&mut buf, b"IDAT", &[1, 2, 3]);
        push_chunk(&mut buf, b"acTL", &[0; 8]);
        assert_eq!(detect(&buf).unwrap().ext, "png");
    }

    #[test]
    fn jpeg_xl_and_motion_jpeg2000_are_not_images() {
        assert_eq!(detect(&[0xFF, 0x0A, 0x00, 0x00]), None);
        let mut jxl = vec![
            0x00, 0x00, 0x00, 0x0C, b'J', b'X', b'L', b' ', 0x0D, 0x0A, 0x87, 0x0A,
        ];
        jxl.extend_from_slice(b"\x00\x00\x00\x14ftypjxl ");
        assert_eq!(detect(&jxl), None);

        let mut mj2 = JP2_SIGNATURE.to_vec();
        mj2.extend_from_slice(b"\x00\x00\x00\x14ftypmjp2");
        assert_eq!(detect(&mj2), None);
        let mut jp2 = JP2_SIGNATURE.to_vec();
        jp2.extend_from_slice(b"\x00\x00\x00\x14ftypjp2 ");
        assert_eq!(detect(&jp2).unwrap().ext, "jp2");
    }

    #[test]
    fn detects_unsupported_formats() {
        assert_eq!(detect(b"GIF89a\x01\x00").unwrap().ext, "gif");
        assert_eq!(detect(b"RIFF\x24\x00\x00\x00WEBPVP8 ").unwrap().ext, "webp");
        assert_eq!(detect(b"BM\x36\x00\x00\x00").unwrap().ext, "bmp");
        assert_eq!(detect(&[0x00, 0x00, 0x01, 0x00, 0x01, 0x00]).unwrap().ext, "ico");
        assert_eq!(detect(b"\x00\x00\x00\x1cftypavif\x00\x00").unwrap().ext, "avif");
        assert_eq!(detect(b"\x00\x00\x00\x18ftypheic\x00\x00").unwrap().mime, "image/heic");
        assert_eq!(detect(b"II\x2a\x00\x10\x00\x00\x00CR\x02\x00").unwrap().ext, "cr2");
        assert_eq!(detect(b"MM\x00\x2a\x00\x00\x00\x08").unwrap().ext, "tif");
        for ext in ["gif", "webp", "bmp", "ico", "avif", "tif"] {
            assert!(!SUPPORTED_EXTENSIONS.contains(&ext));
        }
    }

    #[test]
    fn non_image_content_is_undetected() {
        assert!(detect(b"").is_none());
        assert!(detect(b"<").is_none());
        assert!(detect(b"<!DOCTYPE html><html></html>").is_none());
        assert!(detect(b"%PDF-1.7\n").is_none());
        assert!(detect(b"\x00\x00\x00\x18ftypisom\x00\x00").is_none());
    }
}
