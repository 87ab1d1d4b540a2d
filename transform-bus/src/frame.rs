use std::fmt::{Display, Formatter};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

/// Bounded; a full channel blocks the producer.
pub type FrameSender = tokio::sync::mpsc::Sender<FrameCmd>;
pub type FrameReceiver = tokio::sync::mpsc::Receiver<FrameCmd>;

#[derive(Clone, Debug)]
pub enum FrameCmd {
    Data(Frame),
    EOF,
}

/// Frames of `receiver` up to end of stream.
pub fn frame_stream(receiver: FrameReceiver) -> BoxStream<'static, Frame> {
    ReceiverStream::new(receiver)
        .take_while(|cmd| futures::future::ready(matches!(cmd, FrameCmd::Data(_))))
        .filter_map(|cmd| async move {
            match cmd {
                FrameCmd::Data(frame) => Some(frame),
                FrameCmd::EOF => None,
            }
        })
        .boxed()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Y plane followed by one interleaved UV plane, 4:2:0.
    Nv12,
    /// Y, U and V planes, 4:2:0.
    I420,
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
}

/// Location of one plane inside an image buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    /// Bytes of visible pixel data per row.
    pub row_bytes: usize,
    pub rows: usize,
    /// Distance between two rows.
    pub pitch: usize,
}

impl PlaneLayout {
    /// First byte after the last row.
    pub fn end(&self) -> usize {
        match self.rows {
            0 => self.offset,
            rows => self.offset + (rows - 1) * self.pitch + self.row_bytes,
        }
    }
}

impl PixelFormat {
    pub fn is_yuv420(&self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::I420)
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::I420 => 1,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => 4,
        }
    }

    /// Plane layout of an image whose first plane rows are `pitch` bytes
    /// apart. Chroma planes of I420 use half the pitch, NV12 shares it.
    /// Returns `None` if `pitch` cannot hold a row.
    pub fn plane_layout(&self, width: u32, height: u32, pitch: usize) -> Option<Vec<PlaneLayout>> {
        let width = width as usize;
        let height = height as usize;
        let chroma_width = width.div_ceil(2);
        let chroma_height = height.div_ceil(2);

        let row_bytes = width * self.bytes_per_pixel();
        if pitch < row_bytes {
            return None;
        }

        let first = PlaneLayout {
            offset: 0,
            row_bytes,
            rows: height,
            pitch,
        };
        let planes = match self {
            PixelFormat::Nv12 => {
                if pitch < chroma_width * 2 {
                    return None;
                }
                vec![
                    first,
                    PlaneLayout {
                        offset: pitch * height,
                        row_bytes: chroma_width * 2,
                        rows: chroma_height,
                        pitch,
                    },
                ]
            }
            PixelFormat::I420 => {
                let chroma_pitch = pitch.div_ceil(2);
                let u = PlaneLayout {
                    offset: pitch * height,
                    row_bytes: chroma_width,
                    rows: chroma_height,
                    pitch: chroma_pitch,
                };
                let v = PlaneLayout {
                    offset: u.offset + chroma_pitch * chroma_height,
                    ..u
                };
                vec![first, u, v]
            }
            _ => vec![first],
        };
        Some(planes)
    }

    /// Plane layout without row padding.
    pub fn packed_layout(&self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let pitch = width as usize * self.bytes_per_pixel();
        let mut planes = self.plane_layout(width, height, pitch).unwrap_or_default();
        // I420 chroma of odd widths would otherwise inherit the rounded pitch.
        let mut offset = 0;
        for plane in planes.iter_mut() {
            plane.pitch = plane.row_bytes;
            plane.offset = offset;
            offset += plane.row_bytes * plane.rows;
        }
        planes
    }

    /// Bytes needed by a padded image, including the padding of every row.
    pub fn buffer_size(&self, width: u32, height: u32, pitch: usize) -> Option<usize> {
        self.plane_layout(width, height, pitch).map(|planes| {
            planes
                .iter()
                .map(|p| p.offset + p.pitch * p.rows)
                .max()
                .unwrap_or(0)
        })
    }

    /// Bytes of a tightly packed image.
    pub fn packed_size(&self, width: u32, height: u32) -> usize {
        self.packed_layout(width, height)
            .iter()
            .map(|p| p.row_bytes * p.rows)
            .sum()
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let name = match self {
            PixelFormat::Nv12 => "nv12",
            PixelFormat::I420 => "i420",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgba32 => "rgba32",
            PixelFormat::Bgra32 => "bgra32",
        };
        f.write_str(name)
    }
}

/// A picture with tightly packed planes.
#[derive(Clone, Debug)]
pub struct Frame {
    format: PixelFormat,
    width: u32,
    height: u32,
    data: Bytes,
    presentation_time: i64,
}

impl Frame {
    /// Wraps packed pixel data. Fails if `data` does not match the packed size.
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        data: impl Into<Bytes>,
    ) -> anyhow::Result<Self> {
        let data = data.into();
        if width == 0 || height == 0 {
            anyhow::bail!("invalid frame size {}x{}", width, height);
        }
        let expected = format.packed_size(width, height);
        if data.len() != expected {
            anyhow::bail!(
                "{} frame {}x{} needs {} bytes, got {}",
                format,
                width,
                height,
                expected,
                data.len()
            );
        }
        Ok(Self {
            format,
            width,
            height,
            data,
            presentation_time: 0,
        })
    }

    /// Copies an image with padded rows into a packed frame.
    /// Returns `None` if `source` is shorter than the layout requires.
    pub fn from_padded(
        format: PixelFormat,
        width: u32,
        height: u32,
        source: &[u8],
        pitch: usize,
    ) -> Option<Self> {
        let source_planes = format.plane_layout(width, height, pitch)?;
        if source_planes.iter().any(|p| p.end() > source.len()) {
            return None;
        }

        let mut data = Vec::with_capacity(format.packed_size(width, height));
        for plane in &source_planes {
            for row in 0..plane.rows {
                let start = plane.offset + row * plane.pitch;
                data.extend_from_slice(&source[start..start + plane.row_bytes]);
            }
        }

        Some(Self {
            format,
            width,
            height,
            data: Bytes::from(data),
            presentation_time: 0,
        })
    }

    pub fn with_presentation_time(mut self, presentation_time: i64) -> Self {
        self.presentation_time = presentation_time;
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Presentation time in microseconds.
    pub fn presentation_time(&self) -> i64 {
        self.presentation_time
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Packed bytes of plane `index`.
    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let plane = self
            .format
            .packed_layout(self.width, self.height)
            .get(index)
            .copied()?;
        self.data.get(plane.offset..plane.offset + plane.row_bytes * plane.rows)
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame format: {}, width: {}, height: {}, data_len: {}, pts: {}",
            self.format,
            self.width,
            self.height,
            self.data.len(),
            self.presentation_time
        )
    }
}
