use std::sync::Arc;

use anyhow::{anyhow, bail};

use crate::frame::{Frame, PixelFormat, PlaneLayout};

/// Destination image inside a locked transform buffer.
pub struct TargetImage<'a> {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Luma row pitch in bytes.
    pub pitch: usize,
    pub data: &'a mut [u8],
}

/// Converts caller frames into the layout the encoder consumes.
pub trait PixelConverter: Send + Sync {
    fn convert(&self, source: &Frame, target: &mut TargetImage<'_>) -> anyhow::Result<()>;
}

/// Converter used by [`crate::encoder::VideoEncoder::new`]: swscale when
/// built with the `ffmpeg` feature, [`PlanarConverter`] otherwise.
pub fn default_converter() -> Arc<dyn PixelConverter> {
    #[cfg(feature = "ffmpeg")]
    {
        Arc::new(crate::scaler::SwsConverter::new())
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Arc::new(PlanarConverter)
    }
}

/// Repacks NV12 and I420 frames into NV12 or I420 at any pitch. Colour
/// conversion from RGB formats needs swscale and is rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlanarConverter;

impl PixelConverter for PlanarConverter {
    fn convert(&self, source: &Frame, target: &mut TargetImage<'_>) -> anyhow::Result<()> {
        if !source.format().is_yuv420() {
            bail!(
                "{} input needs the `ffmpeg` feature to be converted to {}",
                source.format(),
                target.format
            );
        }
        let mut writer = PlaneWriter::new(source, target)?;
        copy_yuv(source, &mut writer);
        Ok(())
    }
}

/// Checks a 4:2:0 target against the source frame and writes its planes.
pub(crate) struct PlaneWriter<'a> {
    format: PixelFormat,
    planes: Vec<PlaneLayout>,
    data: &'a mut [u8],
}

impl<'a> PlaneWriter<'a> {
    pub(crate) fn new(source: &Frame, target: &'a mut TargetImage<'_>) -> anyhow::Result<Self> {
        if !target.format.is_yuv420() {
            bail!("cannot convert into {}", target.format);
        }
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

        Ok(Self {
            format: target.format,
            planes,
            data: &mut *target.data,
        })
    }

    pub(crate) fn luma_row(&mut self, row: usize) -> &mut [u8] {
        let plane = self.planes[0];
        let start = plane.offset + row * plane.pitch;
        &mut self.data[start..start + plane.row_bytes]
    }

    pub(crate) fn put_chroma(&mut self, x: usize, y: usize, u: u8, v: u8) {
        match self.format {
            PixelFormat::I420 => {
                let (up, vp) = (self.planes[1], self.planes[2]);
                self.data[up.offset + y * up.pitch + x] = u;
                self.data[vp.offset + y * vp.pitch + x] = v;
            }
            _ => {
                let uv = self.planes[1];
                let at = uv.offset + y * uv.pitch + 2 * x;
                self.data[at] = u;
                self.data[at + 1] = v;
            }
        }
    }
}

fn chroma_at(frame: &Frame, planes: &[PlaneLayout], x: usize, y: usize) -> (u8, u8) {
    let data = frame.data();
    match frame.format() {
        PixelFormat::I420 => {
            let (up, vp) = (planes[1], planes[2]);
            (data[up.offset + y * up.pitch + x], data[vp.offset + y * vp.pitch + x])
        }
        _ => {
            let at = planes[1].offset + y * planes[1].pitch + 2 * x;
            (data[at], data[at + 1])
        }
    }
}

fn copy_yuv(source: &Frame, writer: &mut PlaneWriter<'_>) {
    let width = source.width() as usize;
    let source_planes = source.format().packed_layout(source.width(), source.height());
    let data = source.data();

    for row in 0..source.height() as usize {
        let start = row * width;
        writer.luma_row(row).copy_from_slice(&data[start..start + width]);
    }

    let chroma = source_planes[1];
    for y in 0..chroma.rows {
        for x in 0..width.div_ceil(2) {
            let (u, v) = chroma_at(source, &source_planes, x, y);
            writer.put_chroma(x, y, u, v);
        }
    }
}
