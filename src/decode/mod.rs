pub mod luma;
pub mod qr;

use async_trait::async_trait;

use crate::capture::Frame;
use crate::error::DecodeError;

pub use qr::QrDecoder;

/// Opaque image-to-payload extraction service.
///
/// The session owns the frame for the whole call and releases it afterwards,
/// so implementations only borrow it and perform no retries or cleanup.
#[async_trait]
pub trait Decoder: Send + Sync + 'static {
    /// Candidate payloads found in the frame. An empty list means no code was
    /// visible, which is not an error.
    async fn decode(&self, frame: &Frame) -> Result<Vec<String>, DecodeError>;
}
