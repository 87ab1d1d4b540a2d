//! Lifecycle shared by decoder and encoder sessions: transform discovery,
//! media type negotiation and the streaming state machine.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SessionError, TransformError};
use crate::frame::PixelFormat;
use crate::platform::PlatformLease;
use crate::transform::{
    Codec, ControlMessage, MediaType, NATIVE_UNITS_PER_MICROSECOND, Role, Subtype, Transform,
    TransformActivate, TransformProvider,
};

pub const MAX_WIDTH: u32 = 1920 * 8;
pub const MAX_HEIGHT: u32 = 1080 * 8;

/// Stream changes handled by one drain before giving up.
pub(crate) const MAX_STREAM_CHANGES: usize = 4;

/// Pause of a session task loop with nothing to do.
pub(crate) const IDLE_WAIT: Duration = Duration::from_millis(1);

/// How long a session task keeps offering one input that is refused.
pub(crate) const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
    Released,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::Started => "started",
            SessionState::Stopped => "stopped",
            SessionState::Released => "released",
        };
        f.write_str(name)
    }
}

/// How output samples are obtained from the transform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputProvisioning {
    /// The transform hands out its own samples.
    pub transform_allocates: bool,
    /// Size the caller's buffer must have otherwise, 0 if unknown.
    pub size_hint: usize,
}

pub(crate) fn validate_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width > MAX_WIDTH || height > MAX_HEIGHT {
        log::error!(
            "invalid frame size {}x{}, limits are 1..={}x1..={}",
            width,
            height,
            MAX_WIDTH,
            MAX_HEIGHT
        );
        return Err(SessionError::InvalidParameter(format!(
            "frame size {}x{}",
            width, height
        )));
    }
    Ok(())
}

/// Microseconds to transform time units.
pub(crate) fn native_time(presentation_time: i64) -> Result<i64> {
    presentation_time
        .checked_mul(NATIVE_UNITS_PER_MICROSECOND)
        .ok_or_else(|| {
            log::error!("presentation time {} out of range", presentation_time);
            SessionError::InvalidParameter(format!("presentation time {}", presentation_time))
        })
}

pub(crate) fn codec_from_mime(mime: &str) -> Result<Codec> {
    if mime.is_empty() {
        log::error!("codec mime type is empty");
        return Err(SessionError::InvalidParameter("empty mime type".to_string()));
    }
    Codec::from_mime(mime).ok_or_else(|| {
        log::error!("unsupported codec mime type {}", mime);
        SessionError::UnsupportedFormat(mime.to_string())
    })
}

/// What a session asks of a transform candidate.
pub(crate) struct NegotiationRequest {
    pub role: Role,
    pub codec: Codec,
    /// Compressed port type, set first.
    pub encoded: MediaType,
    /// Raw port attributes. Also the type tried when the transform offers
    /// nothing usable.
    pub raw: MediaType,
    /// Copy size, frame rate and scan type of `raw` onto offered types.
    pub override_raw_attributes: bool,
}

impl NegotiationRequest {
    fn adapt(&self, mut offered: MediaType) -> MediaType {
        if self.override_raw_attributes {
            offered.width = self.raw.width;
            offered.height = self.raw.height;
            offered.frame_rate = self.raw.frame_rate;
            offered.progressive = self.raw.progressive;
        }
        offered
    }

    fn available_raw(&self, transform: &dyn Transform, index: usize) -> Option<MediaType> {
        match self.role {
            Role::Decoder => transform.available_output_type(index),
            Role::Encoder => transform.available_input_type(index),
        }
    }

    fn set_raw(
        &self,
        transform: &mut dyn Transform,
        media_type: &MediaType,
    ) -> std::result::Result<(), TransformError> {
        match self.role {
            Role::Decoder => transform.set_output_type(media_type),
            Role::Encoder => transform.set_input_type(media_type),
        }
    }

    fn set_encoded(
        &self,
        transform: &mut dyn Transform,
    ) -> std::result::Result<(), TransformError> {
        match self.role {
            Role::Decoder => transform.set_input_type(&self.encoded),
            Role::Encoder => transform.set_output_type(&self.encoded),
        }
    }

    /// Raw side: NV12 if offered, then the first offered type, then `raw`.
    fn negotiate_raw(
        &self,
        transform: &mut dyn Transform,
    ) -> std::result::Result<(), TransformError> {
        let nv12 = (0..)
            .map_while(|index| self.available_raw(&*transform, index))
            .find(|offered| offered.subtype == Subtype::Raw(PixelFormat::Nv12));
        if let Some(offered) = nv12 {
            let adapted = self.adapt(offered);
            match self.set_raw(transform, &adapted) {
                Ok(()) => return Ok(()),
                Err(e) => log::debug!("offered nv12 type rejected: {}", e),
            }
        }

        if let Some(first) = self.available_raw(&*transform, 0) {
            let adapted = self.adapt(first);
            match self.set_raw(transform, &adapted) {
                Ok(()) => return Ok(()),
                Err(e) => log::debug!("first offered type rejected: {}", e),
            }
        }

        self.set_raw(transform, &self.raw)
    }

    fn try_candidate(
        &self,
        candidate: &dyn TransformActivate,
    ) -> std::result::Result<Box<dyn Transform>, TransformError> {
        let mut transform = candidate.activate()?;
        self.set_encoded(transform.as_mut())?;
        self.negotiate_raw(transform.as_mut())?;
        Ok(transform)
    }
}

/// Transform ownership and state machine of one session.
///
/// Not synchronized; the owning session keeps it behind its mutex.
pub(crate) struct TransformSession {
    name: &'static str,
    provider: Arc<dyn TransformProvider>,
    transform: Option<Box<dyn Transform>>,
    lease: Option<PlatformLease>,
    state: SessionState,
    codec: Option<Codec>,
    width: u32,
    height: u32,
    provisioning: OutputProvisioning,
}

impl TransformSession {
    pub fn new(name: &'static str, provider: Arc<dyn TransformProvider>) -> Self {
        Self {
            name,
            provider,
            transform: None,
            lease: None,
            state: SessionState::Uninitialized,
            codec: None,
            width: 0,
            height: 0,
            provisioning: OutputProvisioning::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.transform.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.state == SessionState::Started
    }

    pub fn codec(&self) -> Option<Codec> {
        self.codec
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn provisioning(&self) -> OutputProvisioning {
        self.provisioning
    }

    pub fn transform(&self) -> Option<&(dyn Transform + 'static)> {
        self.transform.as_deref()
    }

    pub fn transform_mut(&mut self) -> Option<&mut (dyn Transform + 'static)> {
        self.transform.as_deref_mut()
    }

    fn usage_error(&self, operation: &'static str) -> SessionError {
        log::error!(
            "{}: {} is not valid while the session is {}",
            self.name,
            operation,
            self.state
        );
        SessionError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// The transform, if the session holds one.
    pub fn live_transform(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut (dyn Transform + 'static)> {
        if self.transform.is_none() {
            return Err(self.usage_error(operation));
        }
        let state = self.state;
        self.transform
            .as_deref_mut()
            .ok_or(SessionError::InvalidState { operation, state })
    }

    /// The transform, if the session is streaming.
    pub fn started_transform(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut (dyn Transform + 'static)> {
        if !self.is_started() {
            return Err(self.usage_error(operation));
        }
        self.live_transform(operation)
    }

    /// Discovers, activates and configures a transform. On failure the
    /// session stays uninitialized and holds no platform lease.
    pub fn initialize(&mut self, request: NegotiationRequest) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(self.usage_error("initialize"));
        }

        let lease = PlatformLease::acquire(self.provider.clone()).map_err(|e| {
            log::error!("{}: media platform startup failed: {}", self.name, e);
            SessionError::PlatformStartup(e)
        })?;

        let not_found = SessionError::NoTransformAvailable {
            role: request.role,
            codec: request.codec,
        };
        let candidates = match self.provider.enumerate(request.role, request.codec) {
            Ok(candidates) => candidates,
            Err(e) => {
                log::error!(
                    "{}: enumerating {} transforms for {} failed: {}",
                    self.name,
                    request.role,
                    request.codec,
                    e
                );
                return Err(not_found);
            }
        };

        let mut selected = None;
        for candidate in candidates.iter() {
            match request.try_candidate(candidate.as_ref()) {
                Ok(transform) => {
                    log::info!("{}: using transform {}", self.name, candidate.name());
                    selected = Some(transform);
                    break;
                }
                Err(e) => log::warn!(
                    "{}: transform {} rejected: {}",
                    self.name,
                    candidate.name(),
                    e
                ),
            }
        }
        drop(candidates);

        let Some(transform) = selected else {
            log::error!(
                "{}: no {} transform accepted {} {}x{}",
                self.name,
                request.role,
                request.codec,
                request.raw.width,
                request.raw.height
            );
            return Err(not_found);
        };

        self.transform = Some(transform);
        self.lease = Some(lease);
        self.codec = Some(request.codec);
        self.width = request.raw.width;
        self.height = request.raw.height;
        self.probe_output();
        self.state = SessionState::Initialized;
        Ok(())
    }

    /// Re-reads the output provisioning. Keeps the previous values if the
    /// transform cannot report them.
    pub fn probe_output(&mut self) {
        let Some(info) = self.transform.as_ref().and_then(|t| t.output_stream_info()) else {
            return;
        };
        self.provisioning = OutputProvisioning {
            transform_allocates: info.allocates_output(),
            size_hint: info.size,
        };
    }

    /// Selects a new output type after a stream change: NV12 if offered,
    /// otherwise the first offered type.
    pub fn renegotiate_output(&mut self) {
        if let Some(transform) = self.transform.as_mut() {
            let nv12 = (0..)
                .map_while(|index| transform.available_output_type(index))
                .find(|offered| offered.subtype == Subtype::Raw(PixelFormat::Nv12));
            match nv12.or_else(|| transform.available_output_type(0)) {
                Some(media_type) => {
                    if let Err(e) = transform.set_output_type(&media_type) {
                        log::warn!("{}: output type after stream change rejected: {}", self.name, e);
                    } else {
                        log::info!(
                            "{}: output renegotiated to {:?} {}x{}",
                            self.name,
                            media_type.subtype,
                            media_type.width,
                            media_type.height
                        );
                    }
                }
                None => log::warn!("{}: no output type offered after stream change", self.name),
            }
        }
        self.probe_output();
    }

    /// Begins streaming. Starting a started session does nothing.
    pub fn start(&mut self, flush_first: bool) -> Result<()> {
        match self.state {
            SessionState::Started => return Ok(()),
            SessionState::Initialized | SessionState::Stopped => {}
            _ => return Err(self.usage_error("start")),
        }

        let name = self.name;
        let transform = self.live_transform("start")?;
        if flush_first {
            if let Err(e) = transform.send_message(ControlMessage::Flush) {
                log::warn!("{}: flush before streaming failed: {}", name, e);
            }
        }
        for message in [ControlMessage::BeginStreaming, ControlMessage::StartOfStream] {
            transform.send_message(message).map_err(|source| {
                log::error!("{}: transform rejected {:?}: {}", name, message, source);
                SessionError::TransformSignalRejected { message, source }
            })?;
        }

        self.state = SessionState::Started;
        Ok(())
    }

    /// First half of stop: asks the transform to drain. Returns false if
    /// the session is not streaming.
    pub fn begin_stop(&mut self) -> bool {
        if !self.is_started() {
            return false;
        }
        let name = self.name;
        if let Some(transform) = self.transform.as_mut() {
            if let Err(e) = transform.send_message(ControlMessage::Drain) {
                log::warn!("{}: drain on stop failed: {}", name, e);
            }
        }
        true
    }

    /// Second half of stop, after the remaining outputs were collected.
    pub fn finish_stop(&mut self) {
        let name = self.name;
        if let Some(transform) = self.transform.as_mut() {
            for message in [ControlMessage::EndOfStream, ControlMessage::EndStreaming] {
                if let Err(e) = transform.send_message(message) {
                    log::warn!("{}: {:?} on stop failed: {}", name, message, e);
                }
            }
        }
        self.state = SessionState::Stopped;
    }

    /// Drops the transform and the platform lease. The caller stops first.
    pub fn release(&mut self) {
        if self.state == SessionState::Released {
            return;
        }
        self.transform = None;
        self.codec = None;
        self.width = 0;
        self.height = 0;
        self.provisioning = OutputProvisioning::default();
        self.lease = None;
        self.state = SessionState::Released;
        log::debug!("{}: released", self.name);
    }
}
