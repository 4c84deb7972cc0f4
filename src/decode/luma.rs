//! Pixel buffer to upright 8-bit luma conversion

use image::{imageops, GrayImage};
use jpeg_decoder::{Decoder as JpegDecoder, PixelFormat as JpegFormat};

use crate::capture::frame::{FrameMetadata, PixelFormat, Rotation};
use crate::error::DecodeError;

/// Convert a frame buffer to luma and rotate it upright.
pub fn to_luma(data: &[u8], meta: &FrameMetadata) -> Result<GrayImage, DecodeError> {
    let (width, height) = (meta.width as usize, meta.height as usize);
    let stride = meta.stride as usize;

    let image = match meta.format {
        // NV12 starts with a full-resolution Y plane
        PixelFormat::Gray8 | PixelFormat::Nv12 => {
            packed(data, width, height, stride, 1, |px| px[0])?
        }
        PixelFormat::Yuyv4 => packed(data, width, height, stride, 2, |px| px[0])?,
        PixelFormat::Rgb24 => packed(data, width, height, stride, 3, |px| {
            weighted(px[0], px[1], px[2])
        })?,
        PixelFormat::Bgr24 => packed(data, width, height, stride, 3, |px| {
            weighted(px[2], px[1], px[0])
        })?,
        PixelFormat::Mjpeg => decode_jpeg(data)?,
    };

    Ok(match meta.rotation {
        Rotation::Deg0 => image,
        Rotation::Deg90 => imageops::rotate90(&image),
        Rotation::Deg180 => imageops::rotate180(&image),
        Rotation::Deg270 => imageops::rotate270(&image),
    })
}

fn decode_jpeg(data: &[u8]) -> Result<GrayImage, DecodeError> {
    let mut decoder = JpegDecoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or(DecodeError::UnsupportedFormat(PixelFormat::Mjpeg))?;
    let (width, height) = (info.width as usize, info.height as usize);

    match info.pixel_format {
        JpegFormat::L8 => packed(&pixels, width, height, width, 1, |px| px[0]),
        JpegFormat::RGB24 => packed(&pixels, width, height, width * 3, 3, |px| {
            weighted(px[0], px[1], px[2])
        }),
        _ => Err(DecodeError::UnsupportedFormat(PixelFormat::Mjpeg)),
    }
}

/// BT.601 luma in fixed point
fn weighted(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}

fn packed(
    data: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    bytes_per_pixel: usize,
    luma: impl Fn(&[u8]) -> u8,
) -> Result<GrayImage, DecodeError> {
    let row_bytes = width * bytes_per_pixel;
    let stride = stride.max(row_bytes);
    // The last row may omit its padding
    let expected = match height {
        0 => 0,
        h => stride * (h - 1) + row_bytes,
    };
    if data.len() < expected {
        return Err(DecodeError::MalformedBuffer {
            expected,
            actual: data.len(),
        });
    }

    let mut out = Vec::with_capacity(width * height);
    for row in 0..height {
        let start = row * stride;
        out.extend(
            data[start..start + row_bytes]
                .chunks_exact(bytes_per_pixel)
                .map(&luma),
        );
    }

    GrayImage::from_raw(width as u32, height as u32, out).ok_or(DecodeError::MalformedBuffer {
        expected: width * height,
        actual: 0,
    })
}
