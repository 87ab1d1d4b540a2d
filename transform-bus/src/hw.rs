//! FFmpeg backed transforms.
//!
//! Hardware codecs (CUDA/QSV/V4L2M2M for decoding, NVENC/VAAPI/QSV/V4L2M2M
//! for encoding) are enumerated first, the software codec last, so sessions
//! fall back automatically when no accelerator is usable.

use std::fmt::Display;

use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{Dictionary, Rational, picture};

use crate::bsf;
use crate::buffer::{MemoryBuffer, TransformSample};
use crate::error::TransformError;
use crate::frame::PixelFormat;
use crate::scaler::Scaler;
use crate::transform::{
    Codec, ControlMessage, MediaType, NATIVE_UNITS_PER_SECOND, OutputStatus, Role, StreamInfo,
    SubmitError, Subtype, Transform, TransformActivate, TransformProvider,
};

fn platform(e: impl Display) -> TransformError {
    TransformError::Platform(e.to_string())
}

fn is_again(e: &ffmpeg_next::Error) -> bool {
    matches!(e, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}

fn codec_id(codec: Codec) -> ffmpeg_next::codec::Id {
    match codec {
        Codec::H264 => ffmpeg_next::codec::Id::H264,
        Codec::Hevc => ffmpeg_next::codec::Id::HEVC,
    }
}

fn hw_decoder_names(codec: Codec) -> &'static [&'static str] {
    match codec {
        Codec::H264 => &["h264_cuvid", "h264_qsv", "h264_v4l2m2m"],
        Codec::Hevc => &["hevc_cuvid", "hevc_qsv", "hevc_v4l2m2m"],
    }
}

fn hw_encoder_names(codec: Codec) -> &'static [&'static str] {
    match codec {
        Codec::H264 => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        Codec::Hevc => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
    }
}

pub fn pixel_for(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::I420 => Pixel::YUV420P,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Bgr24 => Pixel::BGR24,
        PixelFormat::Rgba32 => Pixel::RGBA,
        PixelFormat::Bgra32 => Pixel::BGRA,
    }
}

fn raw_types(width: u32, height: u32) -> [MediaType; 2] {
    [
        MediaType::new(Subtype::Raw(PixelFormat::Nv12), width, height),
        MediaType::new(Subtype::Raw(PixelFormat::I420), width, height),
    ]
}

fn accept_raw(media_type: &MediaType) -> Result<PixelFormat, TransformError> {
    match media_type.raw_format() {
        Some(format) if format.is_yuv420() => Ok(format),
        _ => Err(TransformError::TypeRejected(format!(
            "{:?}",
            media_type.subtype
        ))),
    }
}

/// Enumerates FFmpeg codecs for both roles.
#[derive(Debug, Default)]
pub struct FfmpegProvider;

impl TransformProvider for FfmpegProvider {
    fn startup(&self) -> Result<(), TransformError> {
        ffmpeg_next::init().map_err(platform)
    }

    fn enumerate(
        &self,
        role: Role,
        codec: Codec,
    ) -> Result<Vec<Box<dyn TransformActivate>>, TransformError> {
        let (hw_names, software) = match role {
            Role::Decoder => (
                hw_decoder_names(codec),
                ffmpeg_next::decoder::find(codec_id(codec)),
            ),
            Role::Encoder => (
                hw_encoder_names(codec),
                ffmpeg_next::encoder::find(codec_id(codec)),
            ),
        };

        let mut names: Vec<String> = hw_names
            .iter()
            .filter(|name| match role {
                Role::Decoder => ffmpeg_next::decoder::find_by_name(name).is_some(),
                Role::Encoder => ffmpeg_next::encoder::find_by_name(name).is_some(),
            })
            .map(|name| name.to_string())
            .collect();
        if let Some(software) = software {
            names.push(software.name().to_string());
        }
        log::info!("{} candidates for {}: {:?}", role, codec, names);

        Ok(names
            .into_iter()
            .map(|name| {
                Box::new(FfmpegActivate { role, codec, name }) as Box<dyn TransformActivate>
            })
            .collect())
    }
}

struct FfmpegActivate {
    role: Role,
    codec: Codec,
    name: String,
}

impl TransformActivate for FfmpegActivate {
    fn name(&self) -> &str {
        &self.name
    }

    fn activate(&self) -> Result<Box<dyn Transform>, TransformError> {
        match self.role {
            Role::Decoder => Ok(Box::new(FfmpegDecoder::new(self.codec, &self.name)?)),
            Role::Encoder => Ok(Box::new(FfmpegEncoder::new(self.codec, &self.name)?)),
        }
    }
}

/// Copies the visible rows of every plane into one packed buffer.
fn pack_frame(frame: &ffmpeg_next::frame::Video, format: PixelFormat) -> Vec<u8> {
    let layout = format.packed_layout(frame.width(), frame.height());
    let mut packed = Vec::with_capacity(format.packed_size(frame.width(), frame.height()));
    for (index, plane) in layout.iter().enumerate() {
        let stride = frame.stride(index);
        let data = frame.data(index);
        for row in 0..plane.rows {
            let start = row * stride;
            packed.extend_from_slice(&data[start..start + plane.row_bytes]);
        }
    }
    packed
}

/// Copies a pitched image into the planes of an FFmpeg frame.
fn fill_frame(
    frame: &mut ffmpeg_next::frame::Video,
    source: &[u8],
    format: PixelFormat,
    pitch: usize,
) -> Result<(), TransformError> {
    let planes = format
        .plane_layout(frame.width(), frame.height(), pitch)
        .ok_or_else(|| TransformError::TypeRejected(format!("stride {}", pitch)))?;
    if let Some(needed) = planes.iter().map(|p| p.end()).max() {
        if needed > source.len() {
            return Err(TransformError::BufferTooSmall {
                needed,
                have: source.len(),
            });
        }
    }
    for (index, plane) in planes.iter().enumerate() {
        let stride = frame.stride(index);
        let data = frame.data_mut(index);
        for row in 0..plane.rows {
            let from = plane.offset + row * plane.pitch;
            let to = row * stride;
            data[to..to + plane.row_bytes].copy_from_slice(&source[from..from + plane.row_bytes]);
        }
    }
    Ok(())
}

struct FfmpegDecoder {
    codec: Codec,
    name: String,
    decoder: ffmpeg_next::decoder::Video,
    input_type: Option<MediaType>,
    output_type: Option<MediaType>,
    /// Size of the pictures the decoder produces.
    coded_size: (u32, u32),
    header_sent: bool,
    eof_sent: bool,
    /// Frame held back across a stream change.
    pending: Option<ffmpeg_next::frame::Video>,
    scaler: Scaler,
}

unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    fn new(codec: Codec, name: &str) -> Result<Self, TransformError> {
        let ffcodec = ffmpeg_next::decoder::find_by_name(name)
            .ok_or_else(|| platform(format!("decoder not found: {}", name)))?;
        let context = ffmpeg_next::codec::Context::new_with_codec(ffcodec);
        let decoder = context
            .decoder()
            .open_as(ffcodec)
            .and_then(|opened| opened.video())
            .map_err(|e| platform(format!("{}: {}", name, e)))?;
        log::info!("decoder opened: {}", name);

        Ok(Self {
            codec,
            name: name.to_string(),
            decoder,
            input_type: None,
            output_type: None,
            coded_size: (0, 0),
            header_sent: false,
            eof_sent: false,
            pending: None,
            scaler: Scaler::new(),
        })
    }

    /// Parameter sets to prepend to the first packet, in Annex B.
    fn parameter_sets(&self) -> Option<Bytes> {
        let header = self.input_type.as_ref()?.sequence_header.clone()?;
        if bsf::is_avcc(&header, true) {
            bsf::convert_avcc_to_annexb(&header, true, self.codec)
        } else {
            Some(header)
        }
    }

    fn restart_after_eof(&mut self) {
        if self.eof_sent {
            self.decoder.flush();
            self.eof_sent = false;
        }
    }
}

impl Transform for FfmpegDecoder {
    fn set_input_type(&mut self, media_type: &MediaType) -> Result<(), TransformError> {
        if media_type.subtype != Subtype::Encoded(self.codec) {
            return Err(TransformError::TypeRejected(format!("{:?}", media_type.subtype)));
        }
        self.coded_size = (media_type.width, media_type.height);
        self.input_type = Some(media_type.clone());
        self.header_sent = false;
        Ok(())
    }

    fn set_output_type(&mut self, media_type: &MediaType) -> Result<(), TransformError> {
        accept_raw(media_type)?;
        let mut media_type = media_type.clone();
        (media_type.width, media_type.height) = self.coded_size;
        self.output_type = Some(media_type);
        Ok(())
    }

    fn available_input_type(&self, index: usize) -> Option<MediaType> {
        (index == 0).then(|| MediaType::new(Subtype::Encoded(self.codec), 0, 0))
    }

    fn available_output_type(&self, index: usize) -> Option<MediaType> {
        let (width, height) = self.coded_size;
        raw_types(width, height).into_iter().nth(index)
    }

    fn current_input_type(&self) -> Option<MediaType> {
        self.input_type.clone()
    }

    fn current_output_type(&self) -> Option<MediaType> {
        self.output_type.clone()
    }

    fn output_stream_info(&self) -> Option<StreamInfo> {
        Some(StreamInfo {
            provides_samples: true,
            lazy_read: false,
            size: 0,
        })
    }

    fn process_input(&mut self, mut sample: TransformSample) -> Result<(), SubmitError> {
        let data = sample.to_vec()?;
        let data = if bsf::is_avcc(&data, false) {
            bsf::convert_avcc_to_annexb(&data, false, self.codec)
                .map(|converted| converted.to_vec())
                .unwrap_or(data)
        } else {
            data
        };

        let mut payload = Vec::with_capacity(data.len());
        let header = if self.header_sent {
            None
        } else {
            self.parameter_sets()
        };
        if let Some(header) = &header {
            payload.extend_from_slice(header);
        }
        payload.extend_from_slice(&data);

        let mut packet = ffmpeg_next::Packet::copy(&payload);
        packet.set_pts(sample.time());
        packet.set_duration(sample.duration().unwrap_or(0));
        match self.decoder.send_packet(&packet) {
            Ok(()) => {
                self.header_sent = true;
                Ok(())
            }
            Err(e) if is_again(&e) => Err(SubmitError::NotAccepting(sample)),
            Err(e) => Err(SubmitError::Failed(platform(format!("{}: {}", self.name, e)))),
        }
    }

    fn process_output(
        &mut self,
        _provided: Option<TransformSample>,
    ) -> Result<OutputStatus, TransformError> {
        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                match self.decoder.receive_frame(&mut frame) {
                    Ok(()) => frame,
                    Err(ffmpeg_next::Error::Eof) => return Ok(OutputStatus::NeedMoreInput),
                    Err(e) if is_again(&e) => return Ok(OutputStatus::NeedMoreInput),
                    Err(e) => return Err(platform(format!("{}: {}", self.name, e))),
                }
            }
        };

        if (frame.width(), frame.height()) != self.coded_size {
            log::info!(
                "{}: picture size {}x{} -> {}x{}",
                self.name,
                self.coded_size.0,
                self.coded_size.1,
                frame.width(),
                frame.height()
            );
            self.coded_size = (frame.width(), frame.height());
            self.output_type = None;
            self.pending = Some(frame);
            return Ok(OutputStatus::StreamChanged);
        }

        let format = self
            .output_type
            .as_ref()
            .and_then(MediaType::raw_format)
            .unwrap_or(PixelFormat::Nv12);
        let target = pixel_for(format);
        let frame = if frame.format() == target {
            frame
        } else {
            self.scaler.run(&frame, target).map_err(platform)?
        };

        let packed = pack_frame(&frame, format);
        let mut sample = TransformSample::new(MemoryBuffer::copy_from(&packed));
        if let Some(time) = frame.timestamp().or(frame.pts()) {
            sample = sample.with_time(time);
        }
        Ok(OutputStatus::Ready(sample))
    }

    fn send_message(&mut self, message: ControlMessage) -> Result<(), TransformError> {
        match message {
            ControlMessage::Flush => {
                self.decoder.flush();
                self.pending = None;
                self.eof_sent = false;
            }
            ControlMessage::Drain => {
                if !self.eof_sent {
                    self.decoder.send_eof().map_err(platform)?;
                    self.eof_sent = true;
                }
            }
            ControlMessage::BeginStreaming | ControlMessage::StartOfStream => {
                self.restart_after_eof();
            }
            ControlMessage::EndStreaming | ControlMessage::EndOfStream => {}
        }
        Ok(())
    }
}

struct FfmpegEncoder {
    codec: Codec,
    name: String,
    encoder: Option<ffmpeg_next::codec::encoder::Video>,
    input_type: Option<MediaType>,
    output_type: Option<MediaType>,
    gop_size: Option<u32>,
    force_key_frame: bool,
    eof_sent: bool,
    sequence_header: Option<Bytes>,
}

unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    fn new(codec: Codec, name: &str) -> Result<Self, TransformError> {
        if ffmpeg_next::encoder::find_by_name(name).is_none() {
            return Err(platform(format!("encoder not found: {}", name)));
        }
        Ok(Self {
            codec,
            name: name.to_string(),
            encoder: None,
            input_type: None,
            output_type: None,
            gop_size: None,
            force_key_frame: false,
            eof_sent: false,
            sequence_header: None,
        })
    }

    fn ensure_open(&mut self) -> Result<&mut ffmpeg_next::codec::encoder::Video, TransformError> {
        if self.encoder.is_none() {
            let opened = self.open()?;
            self.encoder = Some(opened);
        }
        self.encoder
            .as_mut()
            .ok_or_else(|| platform("encoder not open"))
    }

    fn open(&mut self) -> Result<ffmpeg_next::codec::encoder::Video, TransformError> {
        let (Some(input), Some(output)) = (&self.input_type, &self.output_type) else {
            return Err(platform("media types not set"));
        };
        let format = accept_raw(input)?;
        let ffcodec = ffmpeg_next::encoder::find_by_name(&self.name)
            .ok_or_else(|| platform(format!("encoder not found: {}", self.name)))?;

        let mut encoder = ffmpeg_next::codec::Context::new_with_codec(ffcodec)
            .encoder()
            .video()
            .map_err(platform)?;
        encoder.set_width(output.width);
        encoder.set_height(output.height);
        encoder.set_format(pixel_for(format));
        encoder.set_time_base(Rational(1, NATIVE_UNITS_PER_SECOND as i32));
        if let Some((num, den)) = output.frame_rate {
            encoder.set_frame_rate(Some(Rational(num as i32, den as i32)));
        }
        if let Some(bitrate) = output.bitrate {
            encoder.set_bit_rate(bitrate as usize);
        }
        if let Some(gop_size) = self.gop_size {
            encoder.set_gop(gop_size.min(i32::MAX as u32));
        }
        encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);

        let mut options = Dictionary::new();
        if self.name.starts_with("lib") {
            options.set("preset", "ultrafast");
            options.set("tune", "zerolatency");
        }
        let encoder = encoder
            .open_with(options)
            .map_err(|e| platform(format!("{}: {}", self.name, e)))?;

        let extradata = unsafe {
            let context = encoder.0.as_ptr();
            if (*context).extradata.is_null() || (*context).extradata_size <= 0 {
                None
            } else {
                Some(Bytes::copy_from_slice(std::slice::from_raw_parts(
                    (*context).extradata,
                    (*context).extradata_size as usize,
                )))
            }
        };
        self.sequence_header = extradata.and_then(|header| {
            if bsf::is_avcc(&header, true) {
                bsf::convert_avcc_to_annexb(&header, true, self.codec)
            } else {
                Some(header)
            }
        });
        log::info!(
            "encoder opened: {} {}x{}, sequence header {} bytes",
            self.name,
            output.width,
            output.height,
            self.sequence_header.as_ref().map_or(0, Bytes::len)
        );
        Ok(encoder)
    }
}

impl Transform for FfmpegEncoder {
    fn set_input_type(&mut self, media_type: &MediaType) -> Result<(), TransformError> {
        accept_raw(media_type)?;
        self.input_type = Some(media_type.clone());
        self.encoder = None;
        // Opening here lets an unusable hardware encoder be rejected during negotiation.
        if self.output_type.is_some() {
            if let Err(e) = self.ensure_open() {
                self.input_type = None;
                return Err(e);
            }
        }
        Ok(())
    }

    fn set_output_type(&mut self, media_type: &MediaType) -> Result<(), TransformError> {
        if media_type.subtype != Subtype::Encoded(self.codec) {
            return Err(TransformError::TypeRejected(format!("{:?}", media_type.subtype)));
        }
        self.output_type = Some(media_type.clone());
        Ok(())
    }

    fn available_input_type(&self, index: usize) -> Option<MediaType> {
        let (width, height) = self
            .output_type
            .as_ref()
            .map_or((0, 0), |t| (t.width, t.height));
        raw_types(width, height).into_iter().nth(index)
    }

    fn available_output_type(&self, index: usize) -> Option<MediaType> {
        (index == 0).then(|| self.output_type.clone()).flatten()
    }

    fn current_input_type(&self) -> Option<MediaType> {
        self.input_type.clone()
    }

    fn current_output_type(&self) -> Option<MediaType> {
        let mut output = self.output_type.clone()?;
        output.sequence_header = self.sequence_header.clone();
        Some(output)
    }

    fn output_stream_info(&self) -> Option<StreamInfo> {
        Some(StreamInfo {
            provides_samples: true,
            lazy_read: false,
            size: 0,
        })
    }

    fn process_input(&mut self, mut sample: TransformSample) -> Result<(), SubmitError> {
        let Some(input) = self.input_type.clone() else {
            return Err(SubmitError::Failed(platform("input type not set")));
        };
        let format = accept_raw(&input)?;
        let pitch = input
            .default_stride
            .map_or(input.width as usize, |stride| stride as usize);
        let data = sample.to_vec()?;
        let force_key_frame = std::mem::take(&mut self.force_key_frame);

        let mut frame = ffmpeg_next::frame::Video::new(pixel_for(format), input.width, input.height);
        fill_frame(&mut frame, &data, format, pitch)?;
        frame.set_pts(sample.time());
        if force_key_frame {
            frame.set_kind(picture::Type::I);
        }

        let name = self.name.clone();
        let encoder = self.ensure_open()?;
        match encoder.send_frame(&frame) {
            Ok(()) => Ok(()),
            Err(e) if is_again(&e) => {
                self.force_key_frame |= force_key_frame;
                Err(SubmitError::NotAccepting(sample))
            }
            Err(e) => Err(SubmitError::Failed(platform(format!("{}: {}", name, e)))),
        }
    }

    fn process_output(
        &mut self,
        _provided: Option<TransformSample>,
    ) -> Result<OutputStatus, TransformError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(OutputStatus::NeedMoreInput);
        };
        let mut packet = ffmpeg_next::Packet::empty();
        match encoder.receive_packet(&mut packet) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => return Ok(OutputStatus::NeedMoreInput),
            Err(e) if is_again(&e) => return Ok(OutputStatus::NeedMoreInput),
            Err(e) => return Err(platform(format!("{}: {}", self.name, e))),
        }

        let data = packet.data().unwrap_or(&[]);
        let mut sample = TransformSample::new(MemoryBuffer::copy_from(data))
            .with_clean_point(packet.is_key());
        if let Some(pts) = packet.pts() {
            sample = sample.with_time(pts);
        }
        if packet.duration() > 0 {
            sample = sample.with_duration(packet.duration());
        }
        Ok(OutputStatus::Ready(sample))
    }

    fn send_message(&mut self, message: ControlMessage) -> Result<(), TransformError> {
        match message {
            // Discarding buffered frames means starting over with a new context.
            ControlMessage::Flush => {
                self.encoder = None;
                self.eof_sent = false;
            }
            ControlMessage::Drain => {
                if let Some(encoder) = self.encoder.as_mut() {
                    if !self.eof_sent {
                        encoder.send_eof().map_err(platform)?;
                        self.eof_sent = true;
                    }
                }
            }
            ControlMessage::BeginStreaming => {
                self.ensure_open()?;
            }
            ControlMessage::EndStreaming => {
                if self.eof_sent {
                    self.encoder = None;
                    self.eof_sent = false;
                }
            }
            ControlMessage::StartOfStream | ControlMessage::EndOfStream => {}
        }
        Ok(())
    }

    fn set_gop_size(&mut self, frames: u32) -> Result<(), TransformError> {
        if self.gop_size != Some(frames) {
            self.gop_size = Some(frames);
            self.encoder = None;
        }
        Ok(())
    }

    fn request_key_frame(&mut self) -> Result<(), TransformError> {
        self.force_key_frame = true;
        Ok(())
    }
}
