//! Capability interface of a platform media transform.
//!
//! A transform accepts typed input samples and produces typed output samples,
//! possibly with internal latency. Sessions only talk to transforms through
//! the traits in this module; each platform codec framework provides one
//! adapter.

use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::buffer::TransformSample;
use crate::error::TransformError;
use crate::frame::PixelFormat;

/// Transform time unit (100 ns) per microsecond.
pub const NATIVE_UNITS_PER_MICROSECOND: i64 = 10;

/// Transform time units per second.
pub const NATIVE_UNITS_PER_SECOND: i64 = 10_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    H264,
    Hevc,
}

impl Codec {
    /// Maps a MIME type (`video/avc`, `video/h264`, `video/hevc`, `video/h265`).
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "video/avc" | "video/h264" => Some(Codec::H264),
            "video/hevc" | "video/h265" => Some(Codec::Hevc),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Codec::H264 => "video/avc",
            Codec::Hevc => "video/hevc",
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(self.mime())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Decoder,
    Encoder,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Role::Decoder => f.write_str("decoder"),
            Role::Encoder => f.write_str("encoder"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Discard all buffered data.
    Flush,
    /// Emit all buffered data without accepting more input.
    Drain,
    BeginStreaming,
    EndStreaming,
    StartOfStream,
    EndOfStream,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subtype {
    Encoded(Codec),
    Raw(PixelFormat),
}

/// Description of the data on one transform port.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaType {
    pub subtype: Subtype,
    pub width: u32,
    pub height: u32,
    /// Frame rate as numerator / denominator.
    pub frame_rate: Option<(u32, u32)>,
    /// Bits per second.
    pub bitrate: Option<u32>,
    pub progressive: bool,
    /// Row pitch of raw images, in bytes.
    pub default_stride: Option<u32>,
    /// Codec configuration record (parameter sets).
    pub sequence_header: Option<Bytes>,
}

impl MediaType {
    pub fn new(subtype: Subtype, width: u32, height: u32) -> Self {
        Self {
            subtype,
            width,
            height,
            frame_rate: None,
            bitrate: None,
            progressive: false,
            default_stride: None,
            sequence_header: None,
        }
    }

    pub fn raw_format(&self) -> Option<PixelFormat> {
        match self.subtype {
            Subtype::Raw(format) => Some(format),
            Subtype::Encoded(_) => None,
        }
    }

    /// Duration of one frame in native units.
    pub fn frame_duration(&self) -> Option<i64> {
        match self.frame_rate {
            Some((num, den)) if num > 0 => Some(den as i64 * NATIVE_UNITS_PER_SECOND / num as i64),
            _ => None,
        }
    }
}

/// Output port properties.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// The transform allocates its own output samples.
    pub provides_samples: bool,
    /// The transform can hand out its own samples on request.
    pub lazy_read: bool,
    /// Minimum output buffer size, 0 if unknown.
    pub size: usize,
}

impl StreamInfo {
    pub fn allocates_output(&self) -> bool {
        self.provides_samples || self.lazy_read
    }
}

#[derive(Debug)]
pub enum OutputStatus {
    Ready(TransformSample),
    NeedMoreInput,
    /// The output type changed; it must be negotiated again.
    StreamChanged,
}

#[derive(Debug)]
pub enum SubmitError {
    /// Backpressure; the sample is handed back untouched.
    NotAccepting(TransformSample),
    Failed(TransformError),
}

impl From<TransformError> for SubmitError {
    fn from(err: TransformError) -> Self {
        SubmitError::Failed(err)
    }
}

pub trait Transform: Send {
    fn set_input_type(&mut self, media_type: &MediaType) -> Result<(), TransformError>;

    fn set_output_type(&mut self, media_type: &MediaType) -> Result<(), TransformError>;

    /// `index`-th type the input port supports, `None` past the end.
    fn available_input_type(&self, index: usize) -> Option<MediaType>;

    fn available_output_type(&self, index: usize) -> Option<MediaType>;

    fn current_input_type(&self) -> Option<MediaType>;

    fn current_output_type(&self) -> Option<MediaType>;

    fn output_stream_info(&self) -> Option<StreamInfo>;

    fn process_input(&mut self, sample: TransformSample) -> Result<(), SubmitError>;

    /// Retrieves one output unit. `provided` carries the caller's sample when
    /// the transform does not allocate its own.
    fn process_output(
        &mut self,
        provided: Option<TransformSample>,
    ) -> Result<OutputStatus, TransformError>;

    fn send_message(&mut self, message: ControlMessage) -> Result<(), TransformError>;

    /// Key frame distance in frames.
    fn set_gop_size(&mut self, _frames: u32) -> Result<(), TransformError> {
        Err(TransformError::Unsupported)
    }

    fn request_key_frame(&mut self) -> Result<(), TransformError> {
        Err(TransformError::Unsupported)
    }
}

/// A transform candidate returned by enumeration, not yet activated.
pub trait TransformActivate: Send {
    fn name(&self) -> &str;

    fn activate(&self) -> Result<Box<dyn Transform>, TransformError>;
}

pub trait TransformProvider: Send + Sync {
    /// Starts the platform media subsystem. Must tolerate nested calls, each
    /// balanced by one [`TransformProvider::shutdown`].
    fn startup(&self) -> Result<(), TransformError> {
        Ok(())
    }

    fn shutdown(&self) {}

    /// Candidates for `codec` in `role`, best first.
    fn enumerate(
        &self,
        role: Role,
        codec: Codec,
    ) -> Result<Vec<Box<dyn TransformActivate>>, TransformError>;
}
