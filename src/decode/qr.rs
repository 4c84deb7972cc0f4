//! QR code decoder backed by `rqrr`

use async_trait::async_trait;
use image::GrayImage;
use tracing::{debug, instrument};

use crate::capture::Frame;
use crate::decode::luma::to_luma;
use crate::decode::Decoder;
use crate::error::DecodeError;

/// Finds QR symbols in a frame. Grid detection runs on Tokio's blocking pool so
/// decode workers never stall on pixel work.
#[derive(Debug, Default, Clone)]
pub struct QrDecoder;

impl QrDecoder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Decoder for QrDecoder {
    #[instrument(skip_all, fields(sequence = frame.sequence()))]
    async fn decode(&self, frame: &Frame) -> Result<Vec<String>, DecodeError> {
        let (data, meta) = frame.shared();
        tokio::task::spawn_blocking(move || {
            let luma = to_luma(&data, &meta)?;
            Ok(scan_luma(&luma))
        })
        .await
        .map_err(|e| DecodeError::Worker(e.to_string()))?
    }
}

/// Every QR payload in an upright luma image, in detection order.
pub fn scan_luma(image: &GrayImage) -> Vec<String> {
    let (width, height) = image.dimensions();
    let mut prepared =
        rqrr::PreparedImage::prepare_from_greyscale(width as usize, height as usize, |x, y| {
            image.get_pixel(x as u32, y as u32).0[0]
        });

    let mut payloads = Vec::new();
    for grid in prepared.detect_grids() {
        match grid.decode() {
            Ok((_meta, content)) => payloads.push(content),
            // Finder patterns without a readable symbol are common on blurry frames
            Err(e) => debug!("QR grid rejected: {:?}", e),
        }
    }
    payloads
}
