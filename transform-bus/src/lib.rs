//! Hardware video transcoding sessions over platform media transforms.
//!
//! [`decoder::VideoDecoder`] and [`encoder::VideoEncoder`] drive a
//! [`transform::Transform`] found through a [`transform::TransformProvider`];
//! [`bsf`] converts H.264/HEVC elementary streams between length-prefixed and
//! Annex B framing.

pub mod bsf;
pub mod buffer;
pub mod convert;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod packet;
pub mod platform;
pub mod session;
pub mod transform;

#[cfg(feature = "ffmpeg")]
pub mod hw;
#[cfg(feature = "ffmpeg")]
pub mod scaler;

#[cfg(test)]
pub(crate) mod mock;

pub use decoder::{DecoderSettings, DecoderTask, VideoDecoder};
pub use encoder::{EncoderTask, Settings as EncoderSettings, VideoEncoder};
pub use error::{SessionError, TransformError};
pub use frame::{Frame, PixelFormat};
pub use packet::{Sample, SampleFlags};
pub use session::SessionState;
pub use transform::Codec;

/// Registers FFmpeg components. Call once at startup before creating
/// sessions on [`hw::FfmpegProvider`].
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}
