//! Image preprocessing for the vision path.
//!
//! Decodes uncompressed BMP input and resizes it (nearest neighbor) to the
//! vision executor's expected input layout `[1, 768, 768, 3]`, packed as
//! f32 in `[0, 1]`.

use edgelm_kernel::error::{Error, Result};
use edgelm_kernel::io::InputImage;

/// Target input layout of the vision encoder.
pub const TARGET_DIMS: [usize; 4] = [1, 768, 768, 3];

struct DecodedBmp {
    width: usize,
    height: usize,
    /// Row-major top-down RGB triples.
    pixels: Vec<[u8; 3]>,
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| Error::invalid_argument("truncated BMP header"))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::invalid_argument("truncated BMP header"))
}

fn read_i32(bytes: &[u8], offset: usize) -> Result<i32> {
    read_u32(bytes, offset).map(|v| v as i32)
}

fn decode_bmp(bytes: &[u8]) -> Result<DecodedBmp> {
    if bytes.len() < 54 || &bytes[0..2] != b"BM" {
        return Err(Error::invalid_argument("input is not a BMP image"));
    }
    let pixel_offset = read_u32(bytes, 10)? as usize;
    let width = read_i32(bytes, 18)?;
    let height_raw = read_i32(bytes, 22)?;
    let bits_per_pixel = read_u16(bytes, 28)?;
    let compression = read_u32(bytes, 30)?;

    if width <= 0 || height_raw == 0 {
        return Err(Error::invalid_argument(format!(
            "invalid BMP dimensions {width}x{height_raw}"
        )));
    }
    if compression != 0 {
        return Err(Error::unimplemented(
            "compressed BMP images are not supported",
        ));
    }
    if bits_per_pixel != 24 && bits_per_pixel != 32 {
        return Err(Error::unimplemented(format!(
            "unsupported BMP bit depth: {bits_per_pixel}"
        )));
    }

    let width = width as usize;
    // Negative height means top-down row order.
    let top_down = height_raw < 0;
    let height = height_raw.unsigned_abs() as usize;
    let bytes_per_pixel = bits_per_pixel as usize / 8;
    let row_stride = (width * bytes_per_pixel + 3) & !3;

    let mut pixels = Vec::with_capacity(width * height);
    for row in 0..height {
        let source_row = if top_down { row } else { height - 1 - row };
        let row_start = pixel_offset + source_row * row_stride;
        for col in 0..width {
            let p = row_start + col * bytes_per_pixel;
            let bgr = bytes
                .get(p..p + 3)
                .ok_or_else(|| Error::invalid_argument("truncated BMP pixel data"))?;
            pixels.push([bgr[2], bgr[1], bgr[0]]);
        }
    }
    Ok(DecodedBmp {
        width,
        height,
        pixels,
    })
}

/// Decodes and resizes a raw image into the packed f32 tensor the vision
/// executor expects. An empty input fails with `InvalidArgument`.
pub fn preprocess_image(raw: &[u8]) -> Result<InputImage> {
    if raw.is_empty() {
        return Err(Error::invalid_argument("input image is empty"));
    }
    let bmp = decode_bmp(raw)?;
    let [_, target_height, target_width, channels] = TARGET_DIMS;

    let mut data = Vec::with_capacity(target_height * target_width * channels);
    for y in 0..target_height {
        let source_y = (y * bmp.height) / target_height;
        for x in 0..target_width {
            let source_x = (x * bmp.width) / target_width;
            let [r, g, b] = bmp.pixels[source_y * bmp.width + source_x];
            data.push(r as f32 / 255.0);
            data.push(g as f32 / 255.0);
            data.push(b as f32 / 255.0);
        }
    }
    Ok(InputImage {
        data,
        dims: TARGET_DIMS,
    })
}
