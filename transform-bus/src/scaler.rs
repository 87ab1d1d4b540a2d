use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, bail};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context, flag::Flags};

use crate::convert::{PixelConverter, TargetImage};
use crate::frame::{Frame, PlaneLayout};
use crate::hw::pixel_for;

/// Pixel format conversion at constant size. The scaling context is rebuilt
/// when the source geometry or either format changes.
pub struct Scaler {
    context: Option<Context>,
    key: (Pixel, u32, u32, Pixel),
}

impl Scaler {
    pub fn new() -> Self {
        Self {
            context: None,
            key: (Pixel::None, 0, 0, Pixel::None),
        }
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        format: Pixel,
    ) -> anyhow::Result<ffmpeg_next::frame::Video> {
        let key = (frame.format(), frame.width(), frame.height(), format);
        if self.key != key || self.context.is_none() {
            log::debug!(
                "scaler: {:?} {}x{} -> {:?}",
                key.0,
                key.1,
                key.2,
                key.3
            );
            self.context = Some(Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                format,
                frame.width(),
                frame.height(),
                Flags::BILINEAR,
            )?);
            self.key = key;
        }
        let Some(context) = self.context.as_mut() else {
            anyhow::bail!("scaler context missing");
        };

        let mut converted = ffmpeg_next::frame::Video::empty();
        context.run(frame, &mut converted)?;
        converted.set_pts(frame.pts());
        Ok(converted)
    }
}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Scaler {}

/// [`PixelConverter`] backed by swscale. Used by
/// [`crate::encoder::VideoEncoder::new`] when the `ffmpeg` feature is on.
#[derive(Default)]
pub struct SwsConverter {
    scaler: Mutex<Scaler>,
}

impl SwsConverter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PixelConverter for SwsConverter {
    fn convert(&self, source: &Frame, target: &mut TargetImage<'_>) -> anyhow::Result<()> {
        if source.width() != target.width || source.height() != target.height {
            bail!(
                "frame is {}x{}, target is {}x{}",
                source.width(),
                source.height(),
                target.width,
                target.height
            );
        }
        let planes = target
            .format
            .plane_layout(target.width, target.height, target.pitch)
            .ok_or_else(|| anyhow!("pitch {} too small for width {}", target.pitch, target.width))?;
        let needed = planes.iter().map(PlaneLayout::end).max().unwrap_or(0);
        if needed > target.data.len() {
            bail!("target holds {} bytes, layout needs {}", target.data.len(), needed);
        }

        let mut input =
            ffmpeg_next::frame::Video::new(pixel_for(source.format()), source.width(), source.height());
        let packed = source.format().packed_layout(source.width(), source.height());
        for (index, plane) in packed.iter().enumerate() {
            let stride = input.stride(index);
            let data = input.data_mut(index);
            for row in 0..plane.rows {
                let from = plane.offset + row * plane.pitch;
                data[row * stride..row * stride + plane.row_bytes]
                    .copy_from_slice(&source.data()[from..from + plane.row_bytes]);
            }
        }

        let format = pixel_for(target.format);
        let converted = if input.format() == format {
            input
        } else {
            self.scaler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .run(&input, format)?
        };

        for (index, plane) in planes.iter().enumerate() {
            let stride = converted.stride(index);
            let data = converted.data(index);
            for row in 0..plane.rows {
                let to = plane.offset + row * plane.pitch;
                target.data[to..to + plane.row_bytes]
                    .copy_from_slice(&data[row * stride..row * stride + plane.row_bytes]);
            }
        }
        Ok(())
    }
}
