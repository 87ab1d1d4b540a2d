use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferLock, MemoryBuffer, TransformSample};
use crate::convert::{self, PixelConverter, TargetImage};
use crate::error::{Result, SessionError};
use crate::frame::{Frame, FrameCmd, FrameReceiver, PixelFormat};
use crate::packet::{Sample, SampleCmd, SampleFlags, SampleReceiver, SampleSender};
use crate::session::{
    self, IDLE_WAIT, MAX_STREAM_CHANGES, NegotiationRequest, SUBMIT_TIMEOUT, SessionState,
    TransformSession,
};
use crate::transform::{
    Codec, MediaType, NATIVE_UNITS_PER_MICROSECOND, OutputStatus, Role, SubmitError, Subtype,
    TransformProvider,
};

const NAME: &str = "VideoEncoder";

pub const BITRATE_MBPS_1: u32 = 1_000_000;
pub const BITRATE_MBPS_2: u32 = 2_000_000;
pub const BITRATE_MBPS_5: u32 = 5_000_000;
pub const BITRATE_MBPS_10: u32 = 10_000_000;
pub const MAX_BITRATE: u32 = 100_000_000;

/// Highest accepted frame rate; rates below one millihertz are rejected too.
pub const MAX_FRAME_RATE: f64 = 960.0;

/// Row alignment of the raw input type proposed when the transform offers none.
const DEFAULT_STRIDE_ALIGN: u32 = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Bits per second.
    pub bitrate: u32,
    /// Seconds between key frames. 0 makes every frame a key frame, a
    /// negative value asks for a single key frame.
    pub iframe_interval: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mime: "video/avc".to_string(),
            width: 1920,
            height: 1080,
            frame_rate: 30.0,
            bitrate: BITRATE_MBPS_2,
            iframe_interval: 1,
        }
    }
}

impl Settings {
    /// Key frame distance in frames.
    pub fn gop_size(&self) -> u32 {
        match self.iframe_interval {
            i if i < 0 => u32::MAX,
            0 => 1,
            i => ((i as f64 * self.frame_rate).round() as u32).max(1),
        }
    }

    fn validate(&self) -> Result<()> {
        session::validate_dimensions(self.width, self.height)?;
        if !self.frame_rate.is_finite()
            || self.frame_rate > MAX_FRAME_RATE
            || (self.frame_rate * 1000.0).round() < 1.0
        {
            log::error!("{}: invalid frame rate {}", NAME, self.frame_rate);
            return Err(SessionError::InvalidParameter(format!(
                "frame rate {}",
                self.frame_rate
            )));
        }
        if self.bitrate == 0 || self.bitrate > MAX_BITRATE {
            log::error!(
                "{}: invalid bitrate {}, limits are 1..={}",
                NAME,
                self.bitrate,
                MAX_BITRATE
            );
            return Err(SessionError::InvalidParameter(format!(
                "bitrate {}",
                self.bitrate
            )));
        }
        Ok(())
    }

    /// Frame rate as a millihertz fraction.
    fn frame_rate_ratio(&self) -> (u32, u32) {
        ((self.frame_rate * 1000.0).round() as u32, 1000)
    }
}

struct EncoderState {
    session: TransformSession,
    samples: VecDeque<Sample>,
    /// The configuration sample of the current output type was queued.
    config_emitted: bool,
}

impl EncoderState {
    /// Submits one input sample, draining once and retrying once on
    /// backpressure.
    fn submit(&mut self, sample: TransformSample) -> Result<()> {
        let transform = self.session.started_transform("push_frame")?;
        let sample = match transform.process_input(sample) {
            Ok(()) => {
                self.drain_outputs();
                return Ok(());
            }
            Err(SubmitError::NotAccepting(sample)) => sample,
            Err(SubmitError::Failed(e)) => {
                log::error!("{}: submitting frame failed: {}", NAME, e);
                return Err(e.into());
            }
        };

        self.drain_outputs();
        let transform = self.session.started_transform("push_frame")?;
        let result = match transform.process_input(sample) {
            Ok(()) => Ok(()),
            Err(SubmitError::NotAccepting(_)) => {
                log::warn!("{}: transform still not accepting input after drain", NAME);
                Err(SessionError::NotAccepting)
            }
            Err(SubmitError::Failed(e)) => {
                log::error!("{}: submitting frame after drain failed: {}", NAME, e);
                Err(e.into())
            }
        };
        self.drain_outputs();
        result
    }

    /// Moves every available output into the queue.
    fn drain_outputs(&mut self) -> usize {
        let mut collected = 0;
        let mut stream_changes = 0;
        loop {
            let provisioning = self.session.provisioning();
            let provided = (!provisioning.transform_allocates).then(|| {
                let size = match provisioning.size_hint {
                    0 => (self.session.width() * self.session.height()) as usize,
                    hint => hint,
                };
                TransformSample::new(MemoryBuffer::with_capacity(size))
            });

            let Some(transform) = self.session.transform_mut() else {
                break;
            };
            let sample = match transform.process_output(provided) {
                Ok(OutputStatus::Ready(sample)) => sample,
                Ok(OutputStatus::NeedMoreInput) => break,
                Ok(OutputStatus::StreamChanged) => {
                    stream_changes += 1;
                    if stream_changes > MAX_STREAM_CHANGES {
                        log::warn!("{}: too many stream changes while draining", NAME);
                        break;
                    }
                    log::info!("{}: output stream changed", NAME);
                    self.session.renegotiate_output();
                    self.config_emitted = false;
                    continue;
                }
                Err(e) => {
                    log::debug!("{}: draining stopped: {}", NAME, e);
                    break;
                }
            };
            if self.enqueue(sample) {
                collected += 1;
            }
        }
        collected
    }

    /// Queues an encoded sample, preceded by the configuration sample on the
    /// first key frame of the current output type.
    fn enqueue(&mut self, mut sample: TransformSample) -> bool {
        let presentation_time = sample.time().unwrap_or(0) / NATIVE_UNITS_PER_MICROSECOND;
        let key_frame = sample.is_clean_point();

        if key_frame && !self.config_emitted {
            let header = self
                .session
                .transform()
                .and_then(|t| t.current_output_type())
                .and_then(|t| t.sequence_header)
                .filter(|header| !header.is_empty());
            if let Some(header) = header {
                self.samples.push_back(Sample::new(
                    header,
                    presentation_time,
                    SampleFlags::CODEC_CONFIG,
                ));
                self.config_emitted = true;
            }
        }

        let data = match sample.to_vec() {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => return false,
            Err(e) => {
                log::debug!("{}: reading encoded sample failed: {}", NAME, e);
                return false;
            }
        };
        let flags = if key_frame {
            SampleFlags::KEY_FRAME
        } else {
            SampleFlags::NONE
        };
        self.samples
            .push_back(Sample::new(data, presentation_time, flags));
        true
    }

    fn stop(&mut self) {
        if !self.session.begin_stop() {
            return;
        }
        let collected = self.drain_outputs();
        log::debug!("{}: {} samples collected on stop", NAME, collected);
        if let Some(last) = self
            .samples
            .iter_mut()
            .rev()
            .find(|sample| !sample.is_configuration())
        {
            let mut flags = last.flags();
            flags.insert(SampleFlags::END_OF_STREAM);
            last.set_flags(flags);
        }
        self.session.finish_stop();
    }
}

/// Hardware video encoder session: raw frames in, encoded samples out.
///
/// All operations are serialized by an internal lock.
pub struct VideoEncoder {
    state: Mutex<EncoderState>,
    converter: Arc<dyn PixelConverter>,
}

impl VideoEncoder {
    pub fn new(provider: Arc<dyn TransformProvider>) -> Self {
        Self::with_converter(provider, convert::default_converter())
    }

    pub fn with_converter(
        provider: Arc<dyn TransformProvider>,
        converter: Arc<dyn PixelConverter>,
    ) -> Self {
        Self {
            state: Mutex::new(EncoderState {
                session: TransformSession::new(NAME, provider),
                samples: VecDeque::new(),
                config_emitted: false,
            }),
            converter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EncoderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn initialize(&self, settings: &Settings) -> Result<()> {
        let codec = session::codec_from_mime(&settings.mime)?;
        settings.validate()?;

        let frame_rate = Some(settings.frame_rate_ratio());
        let mut encoded = MediaType::new(Subtype::Encoded(codec), settings.width, settings.height);
        encoded.frame_rate = frame_rate;
        encoded.bitrate = Some(settings.bitrate);
        encoded.progressive = true;

        let mut raw = MediaType::new(
            Subtype::Raw(PixelFormat::Nv12),
            settings.width,
            settings.height,
        );
        raw.frame_rate = frame_rate;
        raw.progressive = true;
        raw.default_stride = Some(settings.width.next_multiple_of(DEFAULT_STRIDE_ALIGN));

        let mut state = self.lock();
        state.session.initialize(NegotiationRequest {
            role: Role::Encoder,
            codec,
            encoded,
            raw,
            override_raw_attributes: true,
        })?;

        let gop_size = settings.gop_size();
        if let Some(transform) = state.session.transform_mut() {
            if let Err(e) = transform.set_gop_size(gop_size) {
                log::warn!(
                    "{}: setting key frame distance {} failed, the transform default applies: {}",
                    NAME,
                    gop_size,
                    e
                );
            }
        }
        state.config_emitted = false;
        log::info!(
            "{}: initialized {} {}x{} @ {} fps, {} bps, gop {}",
            NAME,
            codec,
            settings.width,
            settings.height,
            settings.frame_rate,
            settings.bitrate,
            gop_size
        );
        Ok(())
    }

    /// Begins streaming. A new streaming epoch repeats the configuration
    /// sample before its first key frame.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.session.is_started() {
            return Ok(());
        }
        state.session.start(true)?;
        state.config_emitted = false;
        Ok(())
    }

    /// Drains the transform. The last queued sample is flagged end of stream.
    pub fn stop(&self) {
        self.lock().stop();
    }

    /// Submits one frame. `presentation_time` is in microseconds.
    pub fn push_frame(&self, frame: &Frame, presentation_time: i64) -> Result<()> {
        if !frame.is_valid() {
            log::error!("{}: push_frame with empty frame", NAME);
            return Err(SessionError::EmptyBuffer);
        }

        let mut state = self.lock();
        let input_type = state
            .session
            .started_transform("push_frame")?
            .current_input_type();
        let (width, height) = (state.session.width(), state.session.height());
        if frame.width() != width || frame.height() != height {
            log::error!(
                "{}: frame is {}x{}, session expects {}x{}",
                NAME,
                frame.width(),
                frame.height(),
                width,
                height
            );
            return Err(SessionError::DimensionMismatch {
                got_width: frame.width(),
                got_height: frame.height(),
                width,
                height,
            });
        }
        let time = session::native_time(presentation_time)?;

        let format = input_type
            .as_ref()
            .and_then(MediaType::raw_format)
            .filter(PixelFormat::is_yuv420)
            .unwrap_or(PixelFormat::Nv12);
        let pitch = input_type
            .as_ref()
            .and_then(|t| t.default_stride)
            .map_or(width as usize, |stride| stride as usize);
        let size = format.buffer_size(width, height, pitch).ok_or_else(|| {
            log::error!("{}: stride {} too small for width {}", NAME, pitch, width);
            SessionError::InvalidParameter(format!("stride {} for width {}", pitch, width))
        })?;

        let mut buffer = MemoryBuffer::with_capacity(size);
        {
            let mut lock = BufferLock::acquire(&mut buffer)?;
            let mut target = TargetImage {
                format,
                width,
                height,
                pitch,
                data: &mut lock[..],
            };
            self.converter.convert(frame, &mut target).map_err(|e| {
                log::error!(
                    "{}: converting {} frame to {} failed: {}",
                    NAME,
                    frame.format(),
                    format,
                    e
                );
                SessionError::ConversionFailed(e.to_string())
            })?;
            lock.set_len(size)?;
        }

        let mut sample = TransformSample::new(buffer).with_time(time);
        if let Some(duration) = input_type.as_ref().and_then(MediaType::frame_duration) {
            sample = sample.with_duration(duration);
        }
        state.submit(sample)
    }

    /// Next encoded sample. Drains the transform once if nothing is queued.
    pub fn pop_sample(&self) -> Option<Sample> {
        let mut state = self.lock();
        if let Some(sample) = state.samples.pop_front() {
            return Some(sample);
        }
        // stop() already collected the outputs of a stopped session
        if !state.session.is_started() {
            return None;
        }
        state.drain_outputs();
        state.samples.pop_front()
    }

    /// Makes the next encoded frame a key frame.
    pub fn request_key_frame(&self) -> Result<()> {
        let mut state = self.lock();
        let transform = state.session.live_transform("request_key_frame")?;
        transform.request_key_frame().map_err(|e| {
            log::warn!("{}: key frame request failed: {}", NAME, e);
            e.into()
        })
    }

    pub fn release(&self) {
        let mut state = self.lock();
        state.stop();
        state.session.release();
        state.samples.clear();
        state.config_emitted = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().session.is_initialized()
    }

    pub fn is_started(&self) -> bool {
        self.lock().session.is_started()
    }

    pub fn state(&self) -> SessionState {
        self.lock().session.state()
    }

    pub fn codec(&self) -> Option<Codec> {
        self.lock().session.codec()
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

/// Encoded samples buffered between an [`EncoderTask`] and its consumer.
pub const SAMPLE_CHAN_CAP: usize = 64;

/// Runs a [`VideoEncoder`] on a blocking thread between bounded channels.
///
/// Frames are never dropped; the encoder waits for a slow consumer and the
/// frame producer waits for the encoder.
pub struct EncoderTask {
    cancel: CancellationToken,
    capacity: usize,
}

impl EncoderTask {
    pub fn new() -> Self {
        Self::with_capacity(SAMPLE_CHAN_CAP)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cancel: CancellationToken::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Starts `encoder` if needed and feeds it from `frames` until end of
    /// stream. Returns the encoded samples, terminated by [`SampleCmd::EOF`].
    /// Must be called from within a tokio runtime.
    pub fn start(&self, encoder: Arc<VideoEncoder>, frames: FrameReceiver) -> SampleReceiver {
        let (sender, receiver) = tokio::sync::mpsc::channel(self.capacity);
        let cancel = self.cancel.clone();
        log::info!("encoder task starting, codec: {:?}", encoder.codec());
        tokio::task::spawn_blocking(move || Self::encoder_loop(encoder, cancel, frames, sender));
        receiver
    }

    fn encoder_loop(
        encoder: Arc<VideoEncoder>,
        cancel: CancellationToken,
        mut frames: FrameReceiver,
        out: SampleSender,
    ) {
        if let Err(e) = encoder.start() {
            log::error!("encoder task could not start session: {}", e);
            let _ = out.blocking_send(SampleCmd::EOF);
            return;
        }

        let mut encoded = 0usize;
        while !cancel.is_cancelled() {
            match frames.try_recv() {
                Ok(FrameCmd::Data(frame)) => {
                    if !Self::submit(&encoder, &cancel, &frame, &out) {
                        break;
                    }
                    encoded += 1;
                }
                Ok(FrameCmd::EOF) | Err(TryRecvError::Disconnected) => {
                    encoder.stop();
                    if Self::forward_samples(&encoder, &out) {
                        let _ = out.blocking_send(SampleCmd::EOF);
                    }
                    log::info!("encoder task reached end of stream after {} frames", encoded);
                    return;
                }
                Err(TryRecvError::Empty) => std::thread::sleep(IDLE_WAIT),
            }
            if !Self::forward_samples(&encoder, &out) {
                break;
            }
        }
        log::info!("encoder task stopped after {} frames", encoded);
    }

    /// Pushes one frame, forwarding output while the encoder is busy.
    /// Returns false when the task has to end.
    fn submit(
        encoder: &VideoEncoder,
        cancel: &CancellationToken,
        frame: &Frame,
        out: &SampleSender,
    ) -> bool {
        let started = Instant::now();
        loop {
            match encoder.push_frame(frame, frame.presentation_time()) {
                Ok(()) => return true,
                Err(SessionError::NotAccepting) => {
                    if !Self::forward_samples(encoder, out) || cancel.is_cancelled() {
                        return false;
                    }
                    if started.elapsed() > SUBMIT_TIMEOUT {
                        log::error!("encoder refused {} for {:?}", frame, SUBMIT_TIMEOUT);
                        return false;
                    }
                    std::thread::sleep(IDLE_WAIT);
                }
                Err(e) => {
                    log::error!("push frame error: {}", e);
                    return true;
                }
            }
        }
    }

    /// Moves every queued sample to `out`. Returns false once the consumer
    /// is gone.
    fn forward_samples(encoder: &VideoEncoder, out: &SampleSender) -> bool {
        while let Some(sample) = encoder.pop_sample() {
            if out.blocking_send(SampleCmd::Data(sample)).is_err() {
                log::info!("encoded sample consumer closed");
                return false;
            }
        }
        true
    }
}

impl Default for EncoderTask {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
