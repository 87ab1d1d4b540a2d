use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::buffer::{Buffer2DLock, BufferLock, MemoryBuffer, TransformSample};
use crate::error::{Result, SessionError};
use crate::frame::{Frame, FrameCmd, FrameReceiver, FrameSender, PixelFormat};
use crate::packet::{Sample, SampleCmd, SampleReceiver};
use crate::session::{
    self, IDLE_WAIT, MAX_STREAM_CHANGES, NegotiationRequest, SUBMIT_TIMEOUT, SessionState,
    TransformSession,
};
use crate::transform::{
    Codec, ControlMessage, MediaType, NATIVE_UNITS_PER_MICROSECOND, OutputStatus, Role,
    SubmitError, Subtype, TransformProvider,
};

const NAME: &str = "VideoDecoder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    pub mime: String,
    pub width: u32,
    pub height: u32,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            mime: "video/avc".to_string(),
            width: 1920,
            height: 1080,
        }
    }
}

enum Retrieval {
    Frame(Frame),
    /// An output was produced but could not be turned into a frame.
    Dropped,
    NeedMoreInput,
    StreamChanged,
    Failed,
}

struct DecoderState {
    session: TransformSession,
    /// Frames collected while stopping, returned before new output.
    frames: VecDeque<Frame>,
}

/// Hardware video decoder session: encoded samples in, NV12 frames out.
///
/// All operations are serialized by an internal lock.
pub struct VideoDecoder {
    state: Mutex<DecoderState>,
}

impl VideoDecoder {
    pub fn new(provider: Arc<dyn TransformProvider>) -> Self {
        Self {
            state: Mutex::new(DecoderState {
                session: TransformSession::new(NAME, provider),
                frames: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DecoderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finds and configures a decoder for `settings`. `codec_config` is the
    /// codec configuration record (avcC/hvcC) or Annex B parameter sets.
    pub fn initialize(&self, settings: &DecoderSettings, codec_config: Option<&[u8]>) -> Result<()> {
        let codec = session::codec_from_mime(&settings.mime)?;
        session::validate_dimensions(settings.width, settings.height)?;

        let mut encoded = MediaType::new(Subtype::Encoded(codec), settings.width, settings.height);
        encoded.sequence_header = codec_config
            .filter(|config| !config.is_empty())
            .map(Bytes::copy_from_slice);
        let raw = MediaType::new(
            Subtype::Raw(PixelFormat::Nv12),
            settings.width,
            settings.height,
        );

        self.lock().session.initialize(NegotiationRequest {
            role: Role::Decoder,
            codec,
            encoded,
            raw,
            override_raw_attributes: false,
        })?;
        log::info!(
            "{}: initialized {} {}x{}",
            NAME,
            codec,
            settings.width,
            settings.height
        );
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.lock().session.start(false)
    }

    /// Drains the transform and keeps the remaining frames for
    /// [`VideoDecoder::pop_frame`]. Stopping a session that is not started
    /// does nothing.
    pub fn stop(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.session.begin_stop() {
            let collected = collect_frames(&mut state.session, &mut state.frames);
            log::debug!("{}: {} frames collected on stop", NAME, collected);
            state.session.finish_stop();
        }
    }

    /// Submits one encoded access unit. `presentation_time` is in
    /// microseconds.
    pub fn push_sample(&self, data: &[u8], presentation_time: i64) -> Result<()> {
        if data.is_empty() {
            log::error!("{}: push_sample with empty data", NAME);
            return Err(SessionError::EmptyBuffer);
        }

        let mut state = self.lock();
        let transform = state.session.started_transform("push_sample")?;
        let time = session::native_time(presentation_time)?;
        let sample = TransformSample::new(MemoryBuffer::copy_from(data)).with_time(time);
        match transform.process_input(sample) {
            Ok(()) => Ok(()),
            Err(SubmitError::NotAccepting(_)) => Err(SessionError::NotAccepting),
            Err(SubmitError::Failed(e)) => {
                log::error!("{}: submitting {} byte sample failed: {}", NAME, data.len(), e);
                Err(e.into())
            }
        }
    }

    /// Next decoded frame, `Ok(None)` if none is available yet.
    pub fn pop_frame(&self) -> Result<Option<Frame>> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(frame) = state.frames.pop_front() {
            return Ok(Some(frame));
        }
        state.session.live_transform("pop_frame")?;
        match retrieve(&mut state.session) {
            Retrieval::Frame(frame) => Ok(Some(frame)),
            _ => Ok(None),
        }
    }

    /// Asks the transform to emit everything it buffers.
    pub fn drain(&self) -> Result<()> {
        self.send_message("drain", ControlMessage::Drain)
    }

    /// Discards buffered input and undelivered frames, e.g. before a seek.
    pub fn flush(&self) -> Result<()> {
        self.send_message("flush", ControlMessage::Flush)?;
        self.lock().frames.clear();
        Ok(())
    }

    fn send_message(&self, operation: &'static str, message: ControlMessage) -> Result<()> {
        let mut state = self.lock();
        let transform = state.session.live_transform(operation)?;
        transform.send_message(message).map_err(|source| {
            log::error!("{}: transform rejected {:?}: {}", NAME, message, source);
            SessionError::TransformSignalRejected { message, source }
        })
    }

    /// Stops if needed and gives the transform and the platform back.
    pub fn release(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.session.begin_stop() {
            collect_frames(&mut state.session, &mut state.frames);
            state.session.finish_stop();
        }
        state.session.release();
        state.frames.clear();
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

    /// Negotiated size, 0x0 when not initialized.
    pub fn dimensions(&self) -> (u32, u32) {
        let state = self.lock();
        (state.session.width(), state.session.height())
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        self.release();
    }
}

/// Pulls frames until the transform needs input.
fn collect_frames(session: &mut TransformSession, frames: &mut VecDeque<Frame>) -> usize {
    let mut collected = 0;
    let mut stream_changes = 0;
    loop {
        match retrieve(session) {
            Retrieval::Frame(frame) => {
                frames.push_back(frame);
                collected += 1;
            }
            Retrieval::Dropped => {}
            Retrieval::StreamChanged => {
                stream_changes += 1;
                if stream_changes > MAX_STREAM_CHANGES {
                    log::warn!("{}: too many stream changes while collecting", NAME);
                    break;
                }
            }
            Retrieval::NeedMoreInput | Retrieval::Failed => break,
        }
    }
    collected
}

/// Current output size and layout, falling back to the negotiated size.
fn output_geometry(session: &TransformSession) -> (PixelFormat, u32, u32) {
    let current = session.transform().and_then(|t| t.current_output_type());
    let (width, height) = current
        .as_ref()
        .map(|t| (t.width, t.height))
        .filter(|&(w, h)| w > 0 && h > 0)
        .unwrap_or((session.width(), session.height()));
    let format = current
        .as_ref()
        .and_then(MediaType::raw_format)
        .filter(PixelFormat::is_yuv420)
        .unwrap_or(PixelFormat::Nv12);
    (format, width, height)
}

fn retrieve(session: &mut TransformSession) -> Retrieval {
    let provisioning = session.provisioning();
    let provided = if provisioning.transform_allocates {
        None
    } else {
        let (_, width, height) = output_geometry(session);
        let size = provisioning
            .size_hint
            .max(PixelFormat::Nv12.packed_size(width, height));
        Some(TransformSample::new(MemoryBuffer::with_capacity(size)))
    };

    let Some(transform) = session.transform_mut() else {
        return Retrieval::Failed;
    };
    match transform.process_output(provided) {
        Ok(OutputStatus::Ready(mut sample)) => {
            let (format, width, height) = output_geometry(session);
            match frame_from_sample(&mut sample, format, width, height) {
                Some(frame) => Retrieval::Frame(frame),
                None => Retrieval::Dropped,
            }
        }
        Ok(OutputStatus::NeedMoreInput) => Retrieval::NeedMoreInput,
        Ok(OutputStatus::StreamChanged) => {
            log::info!("{}: output stream changed", NAME);
            session.renegotiate_output();
            Retrieval::StreamChanged
        }
        Err(e) => {
            log::error!("{}: retrieving output failed: {}", NAME, e);
            Retrieval::Failed
        }
    }
}

/// Copies a decoded picture into a packed frame. Pitched buffers are read
/// through their 2-D view, flat ones are taken as tightly packed.
fn frame_from_sample(
    sample: &mut TransformSample,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Option<Frame> {
    let presentation_time = sample.time().unwrap_or(0) / NATIVE_UNITS_PER_MICROSECOND;
    let buffer = sample.buffer_mut();

    let frame = if let Some(image) = buffer.as_2d() {
        let lock = match Buffer2DLock::acquire(image) {
            Ok(lock) => lock,
            Err(e) => {
                log::warn!("{}: locking decoded image failed: {}", NAME, e);
                return None;
            }
        };
        Frame::from_padded(format, width, height, lock.scanlines(), lock.pitch())
    } else {
        let lock = match BufferLock::acquire(buffer) {
            Ok(lock) => lock,
            Err(e) => {
                log::warn!("{}: locking decoded buffer failed: {}", NAME, e);
                return None;
            }
        };
        Frame::from_padded(format, width, height, lock.data(), width as usize)
    };

    if frame.is_none() {
        log::warn!(
            "{}: decoded buffer too small for {} {}x{}, frame dropped",
            NAME,
            format,
            width,
            height
        );
    }
    frame.map(|frame| frame.with_presentation_time(presentation_time))
}

/// Decoded frames buffered between a [`DecoderTask`] and its consumer.
pub const FRAME_CHAN_CAP: usize = 16;

/// Runs a [`VideoDecoder`] on a blocking thread between bounded channels.
///
/// Nothing is dropped: a slow consumer stalls the decoder, which stalls the
/// producer of samples.
pub struct DecoderTask {
    cancel: CancellationToken,
    capacity: usize,
}

impl DecoderTask {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_CHAN_CAP)
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

    /// Starts `decoder` if needed and feeds it from `samples` until end of
    /// stream. Returns the decoded frames, terminated by [`FrameCmd::EOF`].
    /// Must be called from within a tokio runtime.
    pub fn start(&self, decoder: Arc<VideoDecoder>, samples: SampleReceiver) -> FrameReceiver {
        let (sender, receiver) = tokio::sync::mpsc::channel(self.capacity);
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || Self::decoder_loop(decoder, cancel, samples, sender));
        receiver
    }

    fn decoder_loop(
        decoder: Arc<VideoDecoder>,
        cancel: CancellationToken,
        mut samples: SampleReceiver,
        out: FrameSender,
    ) {
        if let Err(e) = decoder.start() {
            log::error!("decoder task could not start session: {}", e);
            let _ = out.blocking_send(FrameCmd::EOF);
            return;
        }

        while !cancel.is_cancelled() {
            let eof = match samples.try_recv() {
                Ok(SampleCmd::Data(sample)) => {
                    if !Self::submit(&decoder, &cancel, &sample, &out) {
                        break;
                    }
                    false
                }
                Ok(SampleCmd::EOF) | Err(TryRecvError::Disconnected) => true,
                Err(TryRecvError::Empty) => {
                    if !Self::forward_frames(&decoder, &out) {
                        break;
                    }
                    std::thread::sleep(IDLE_WAIT);
                    continue;
                }
            };

            if eof {
                decoder.stop();
                if Self::forward_frames(&decoder, &out) {
                    let _ = out.blocking_send(FrameCmd::EOF);
                }
                log::info!("decoder task reached end of stream");
                return;
            }
            if !Self::forward_frames(&decoder, &out) {
                break;
            }
        }
        log::info!("decoder task stopped");
    }

    /// Pushes one sample, forwarding output while the decoder refuses it.
    /// Returns false when the task has to end.
    fn submit(
        decoder: &VideoDecoder,
        cancel: &CancellationToken,
        sample: &Sample,
        out: &FrameSender,
    ) -> bool {
        let started = Instant::now();
        loop {
            match decoder.push_sample(sample.data(), sample.presentation_time()) {
                Ok(()) => return true,
                Err(SessionError::NotAccepting) => {
                    if !Self::forward_frames(decoder, out) || cancel.is_cancelled() {
                        return false;
                    }
                    if started.elapsed() > SUBMIT_TIMEOUT {
                        log::error!("decoder refused {} for {:?}", sample, SUBMIT_TIMEOUT);
                        return false;
                    }
                    std::thread::sleep(IDLE_WAIT);
                }
                Err(e) => {
                    log::error!("push sample error: {}", e);
                    return true;
                }
            }
        }
    }

    /// Moves every available frame to `out`. Returns false once the
    /// consumer is gone.
    fn forward_frames(decoder: &VideoDecoder, out: &FrameSender) -> bool {
        loop {
            match decoder.pop_frame() {
                Ok(Some(frame)) => {
                    if out.blocking_send(FrameCmd::Data(frame)).is_err() {
                        log::info!("decoded frame consumer closed");
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    log::error!("pop frame error: {}", e);
                    return true;
                }
            }
        }
    }
}

impl Default for DecoderTask {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
