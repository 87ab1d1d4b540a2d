//! Scripted in-process transform for session tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::buffer::{BufferLock, MemoryBuffer, TransformSample};
use crate::convert::{PixelConverter, PlaneWriter, PlanarConverter, TargetImage};
use crate::error::TransformError;
use crate::frame::{Frame, PixelFormat};
use crate::transform::{
    Codec, ControlMessage, MediaType, OutputStatus, Role, StreamInfo, SubmitError, Subtype,
    Transform, TransformActivate, TransformProvider,
};

#[derive(Clone, Debug)]
pub enum Output {
    Ready { data: Vec<u8>, time: i64, key: bool },
    StreamChanged,
}

/// What the transform produces for each accepted input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Echo {
    #[default]
    Nothing,
    /// One NV12 picture of the current output size, filled with the first
    /// input byte.
    Decoded,
    /// A short encoded unit; every `key_interval`-th one is a key frame.
    Encoded { key_interval: usize },
}

/// Output port state applied when a scripted stream change is consumed.
#[derive(Clone, Debug)]
pub struct StreamChange {
    pub output_types: Vec<MediaType>,
    pub provides_samples: bool,
    pub size_hint: usize,
}

#[derive(Debug, Default)]
pub struct Script {
    pub input_types: Vec<MediaType>,
    pub output_types: Vec<MediaType>,
    /// `set_*_type` fails for these subtypes.
    pub rejected_subtypes: Vec<Subtype>,
    pub provides_samples: bool,
    pub size_hint: usize,
    /// Row pitch of transform allocated outputs.
    pub pitch: Option<usize>,
    /// Upcoming `process_input` calls that are refused.
    pub not_accepting: usize,
    /// Outputs are only released after a drain message.
    pub hold_until_drain: bool,
    pub echo: Echo,
    pub outputs: VecDeque<Output>,
    pub rejected_messages: Vec<ControlMessage>,
    pub gop_supported: bool,
    pub sequence_header: Option<Bytes>,
    pub stream_change: Option<StreamChange>,
    pub fail_startup: bool,

    pub drained: bool,
    pub input_type: Option<MediaType>,
    pub output_type: Option<MediaType>,
    pub messages: Vec<ControlMessage>,
    pub inputs: Vec<(Vec<u8>, Option<i64>, Option<i64>)>,
    pub gop_size: Option<u32>,
    pub key_frame_requests: usize,
    pub startups: usize,
    pub shutdowns: usize,
    pub activations: usize,
    pub dropped: usize,
}

pub fn nv12(width: u32, height: u32) -> MediaType {
    MediaType::new(Subtype::Raw(PixelFormat::Nv12), width, height)
}

impl Script {
    /// Decoder offering one NV12 output type.
    pub fn decoder(width: u32, height: u32) -> Self {
        Self {
            output_types: vec![nv12(width, height)],
            ..Default::default()
        }
    }

    /// Encoder offering one NV12 input type with a 64 byte aligned stride.
    pub fn encoder(width: u32, height: u32) -> Self {
        let mut input = nv12(width, height);
        input.default_stride = Some(width.next_multiple_of(64));
        Self {
            input_types: vec![input],
            gop_supported: true,
            ..Default::default()
        }
    }

    pub fn shared(self) -> Arc<Mutex<Script>> {
        Arc::new(Mutex::new(self))
    }
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MockTransform {
    script: Arc<Mutex<Script>>,
    accepts_encoded: bool,
    produced: usize,
}

impl MockTransform {
    fn check(&self, script: &Script, media_type: &MediaType) -> Result<(), TransformError> {
        let encoded = matches!(media_type.subtype, Subtype::Encoded(_));
        if script.rejected_subtypes.contains(&media_type.subtype) || (encoded && !self.accepts_encoded) {
            return Err(TransformError::TypeRejected(format!("{:?}", media_type.subtype)));
        }
        Ok(())
    }
}

impl Transform for MockTransform {
    fn set_input_type(&mut self, media_type: &MediaType) -> Result<(), TransformError> {
        let mut script = lock(&self.script);
        self.check(&script, media_type)?;
        script.input_type = Some(media_type.clone());
        Ok(())
    }

    fn set_output_type(&mut self, media_type: &MediaType) -> Result<(), TransformError> {
        let mut script = lock(&self.script);
        self.check(&script, media_type)?;
        script.output_type = Some(media_type.clone());
        Ok(())
    }

    fn available_input_type(&self, index: usize) -> Option<MediaType> {
        lock(&self.script).input_types.get(index).cloned()
    }

    fn available_output_type(&self, index: usize) -> Option<MediaType> {
        lock(&self.script).output_types.get(index).cloned()
    }

    fn current_input_type(&self) -> Option<MediaType> {
        lock(&self.script).input_type.clone()
    }

    fn current_output_type(&self) -> Option<MediaType> {
        let script = lock(&self.script);
        let mut current = script.output_type.clone()?;
        if script.sequence_header.is_some() {
            current.sequence_header = script.sequence_header.clone();
        }
        Some(current)
    }

    fn output_stream_info(&self) -> Option<StreamInfo> {
        let script = lock(&self.script);
        Some(StreamInfo {
            provides_samples: script.provides_samples,
            lazy_read: false,
            size: script.size_hint,
        })
    }

    fn process_input(&mut self, mut sample: TransformSample) -> Result<(), SubmitError> {
        let mut script = lock(&self.script);
        if script.not_accepting > 0 {
            script.not_accepting -= 1;
            return Err(SubmitError::NotAccepting(sample));
        }

        let data = sample.to_vec()?;
        let time = sample.time().unwrap_or(0);
        script.inputs.push((data.clone(), sample.time(), sample.duration()));

        match script.echo {
            Echo::Nothing => {}
            Echo::Decoded => {
                let (width, height) = script
                    .output_type
                    .as_ref()
                    .map_or((0, 0), |t| (t.width, t.height));
                let fill = data.first().copied().unwrap_or(0);
                let size = PixelFormat::Nv12.packed_size(width, height);
                script.outputs.push_back(Output::Ready {
                    data: vec![fill; size],
                    time,
                    key: false,
                });
            }
            Echo::Encoded { key_interval } => {
                let key = self.produced % key_interval.max(1) == 0;
                self.produced += 1;
                let nal = if key { 0x65 } else { 0x41 };
                script.outputs.push_back(Output::Ready {
                    data: vec![0, 0, 0, 1, nal, self.produced as u8],
                    time,
                    key,
                });
            }
        }
        Ok(())
    }

    fn process_output(
        &mut self,
        provided: Option<TransformSample>,
    ) -> Result<OutputStatus, TransformError> {
        let mut script = lock(&self.script);
        if script.hold_until_drain && !script.drained {
            return Ok(OutputStatus::NeedMoreInput);
        }
        let Some(output) = script.outputs.pop_front() else {
            return Ok(OutputStatus::NeedMoreInput);
        };

        let (data, time, key) = match output {
            Output::StreamChanged => {
                if let Some(change) = script.stream_change.take() {
                    script.output_types = change.output_types;
                    script.provides_samples = change.provides_samples;
                    script.size_hint = change.size_hint;
                }
                script.output_type = None;
                return Ok(OutputStatus::StreamChanged);
            }
            Output::Ready { data, time, key } => (data, time, key),
        };

        let sample = if script.provides_samples {
            match script.pitch {
                Some(pitch) => TransformSample::new(MemoryBuffer::with_pitch(data, pitch)),
                None => TransformSample::new(MemoryBuffer::copy_from(&data)),
            }
        } else {
            let Some(mut sample) = provided else {
                return Err(TransformError::Platform("no output sample provided".into()));
            };
            let capacity = sample.buffer().capacity();
            if capacity < data.len() {
                script.outputs.push_front(Output::Ready { data: data.clone(), time, key });
                return Err(TransformError::BufferTooSmall {
                    needed: data.len(),
                    have: capacity,
                });
            }
            {
                let mut lock = BufferLock::acquire(sample.buffer_mut())?;
                lock[..data.len()].copy_from_slice(&data);
                lock.set_len(data.len())?;
            }
            sample
        };
        Ok(OutputStatus::Ready(sample.with_time(time).with_clean_point(key)))
    }

    fn send_message(&mut self, message: ControlMessage) -> Result<(), TransformError> {
        let mut script = lock(&self.script);
        script.messages.push(message);
        if script.rejected_messages.contains(&message) {
            return Err(TransformError::Platform(format!("{:?} rejected", message)));
        }
        match message {
            ControlMessage::Drain => script.drained = true,
            ControlMessage::Flush => {
                script.dropped += script.outputs.len();
                script.outputs.clear();
                script.drained = false;
            }
            _ => {}
        }
        Ok(())
    }

    fn set_gop_size(&mut self, frames: u32) -> Result<(), TransformError> {
        let mut script = lock(&self.script);
        if !script.gop_supported {
            return Err(TransformError::Unsupported);
        }
        script.gop_size = Some(frames);
        Ok(())
    }

    fn request_key_frame(&mut self) -> Result<(), TransformError> {
        lock(&self.script).key_frame_requests += 1;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MockCandidate {
    pub name: String,
    pub fail_activate: bool,
    pub accepts_encoded: bool,
}

impl MockCandidate {
    pub fn working(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_activate: false,
            accepts_encoded: true,
        }
    }
}

struct MockActivate {
    candidate: MockCandidate,
    script: Arc<Mutex<Script>>,
}

impl TransformActivate for MockActivate {
    fn name(&self) -> &str {
        &self.candidate.name
    }

    fn activate(&self) -> Result<Box<dyn Transform>, TransformError> {
        if self.candidate.fail_activate {
            return Err(TransformError::Platform("activation failed".into()));
        }
        lock(&self.script).activations += 1;
        Ok(Box::new(MockTransform {
            script: self.script.clone(),
            accepts_encoded: self.candidate.accepts_encoded,
            produced: 0,
        }))
    }
}

pub struct MockProvider {
    pub script: Arc<Mutex<Script>>,
    pub candidates: Vec<MockCandidate>,
}

impl MockProvider {
    pub fn new(script: Arc<Mutex<Script>>) -> Arc<Self> {
        Self::with_candidates(script, vec![MockCandidate::working("mock")])
    }

    pub fn with_candidates(script: Arc<Mutex<Script>>, candidates: Vec<MockCandidate>) -> Arc<Self> {
        Arc::new(Self { script, candidates })
    }
}

impl TransformProvider for MockProvider {
    fn startup(&self) -> Result<(), TransformError> {
        let mut script = lock(&self.script);
        if script.fail_startup {
            return Err(TransformError::Platform("startup failed".into()));
        }
        script.startups += 1;
        Ok(())
    }

    fn shutdown(&self) {
        lock(&self.script).shutdowns += 1;
    }

    fn enumerate(
        &self,
        _role: Role,
        _codec: Codec,
    ) -> Result<Vec<Box<dyn TransformActivate>>, TransformError> {
        Ok(self
            .candidates
            .iter()
            .map(|candidate| {
                Box::new(MockActivate {
                    candidate: candidate.clone(),
                    script: self.script.clone(),
                }) as Box<dyn TransformActivate>
            })
            .collect())
    }
}

/// Locks a shared script for inspection in tests.
pub fn inspect(script: &Arc<Mutex<Script>>) -> MutexGuard<'_, Script> {
    lock(script)
}

/// BT.601 limited range RGB to YUV with 2x2 chroma averaging, so encoder tests
/// can feed RGB frames without swscale.
pub struct Bt601Converter;

impl PixelConverter for Bt601Converter {
    fn convert(&self, source: &Frame, target: &mut TargetImage<'_>) -> anyhow::Result<()> {
        if source.format().is_yuv420() {
            return PlanarConverter.convert(source, target);
        }
        let mut writer = PlaneWriter::new(source, target)?;
        let (width, height) = (source.width() as usize, source.height() as usize);
        let bpp = source.format().bytes_per_pixel();
        let data = source.data();
        let rgb = |x: usize, y: usize| {
            let at = (y * width + x) * bpp;
            let px = &data[at..at + 3];
            match source.format() {
                PixelFormat::Bgr24 | PixelFormat::Bgra32 => {
                    (px[2] as i32, px[1] as i32, px[0] as i32)
                }
                _ => (px[0] as i32, px[1] as i32, px[2] as i32),
            }
        };

        for y in 0..height {
            let row = writer.luma_row(y);
            for (x, luma) in row.iter_mut().enumerate() {
                let (r, g, b) = rgb(x, y);
                *luma = clamp(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16);
            }
        }
        for cy in 0..height.div_ceil(2) {
            for cx in 0..width.div_ceil(2) {
                let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
                for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let (x, y) = (2 * cx + x, 2 * cy + y);
                    if x < width && y < height {
                        let px = rgb(x, y);
                        r += px.0;
                        g += px.1;
                        b += px.2;
                        n += 1;
                    }
                }
                let (r, g, b) = (r / n, g / n, b / n);
                let u = clamp(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128);
                let v = clamp(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128);
                writer.put_chroma(cx, cy, u, v);
            }
        }
        Ok(())
    }
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_nv12(frame: &Frame) -> Vec<u8> {
        let mut data = vec![0u8; PixelFormat::Nv12.packed_size(frame.width(), frame.height())];
        let mut target = TargetImage {
            format: PixelFormat::Nv12,
            width: frame.width(),
            height: frame.height(),
            pitch: frame.width() as usize,
            data: &mut data,
        };
        Bt601Converter.convert(frame, &mut target).unwrap();
        data
    }

    #[test]
    fn test_bt601_white_and_black() {
        let white = Frame::new(PixelFormat::Rgb24, 2, 2, vec![255u8; 12]).unwrap();
        assert_eq!(to_nv12(&white), vec![235, 235, 235, 235, 128, 128]);

        let mut black = vec![0u8; 16];
        black.iter_mut().skip(3).step_by(4).for_each(|a| *a = 255);
        let black = Frame::new(PixelFormat::Bgra32, 2, 2, black).unwrap();
        assert_eq!(to_nv12(&black), vec![16, 16, 16, 16, 128, 128]);
    }

    #[test]
    fn test_bt601_red() {
        let red: Vec<u8> = [255u8, 0, 0].repeat(4);
        let red = Frame::new(PixelFormat::Rgb24, 2, 2, red).unwrap();
        assert_eq!(to_nv12(&red), vec![82, 82, 82, 82, 90, 240]);
    }
}
