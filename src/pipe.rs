use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use transform_bus::bsf::{self, AnnexBFilter};
use transform_bus::frame::FrameCmd;
use transform_bus::packet::{SampleCmd, SampleSender, sample_stream};
use transform_bus::transform::TransformProvider;
use transform_bus::{
    Codec, DecoderSettings, DecoderTask, EncoderSettings, EncoderTask, Sample, SampleFlags,
    VideoDecoder, VideoEncoder,
};

use crate::config::AppConfig;

/// Access units queued ahead of the decoder.
const SAMPLE_CHAN_CAP: usize = 32;
/// Decoded frames queued ahead of the encoder.
const FRAME_CHAN_CAP: usize = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    pub access_units: usize,
    pub frames: usize,
    pub samples: usize,
    pub key_frames: usize,
    pub bytes: usize,
}

impl Display for PipeStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{} access units, {} frames, {} samples ({} key), {} bytes",
            self.access_units, self.frames, self.samples, self.key_frames, self.bytes
        )
    }
}

/// File to file transcode: elementary stream -> decoder -> encoder -> Annex B.
pub(crate) struct Pipe {
    input: PathBuf,
    output: PathBuf,
    codec_config: Option<PathBuf>,
    decoder: DecoderSettings,
    encoder: EncoderSettings,
    cancel: CancellationToken,
}

impl Pipe {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            input: config.input.clone(),
            output: config.output.clone(),
            codec_config: config.codec_config.clone(),
            decoder: config.decoder.clone(),
            encoder: config.encoder.clone(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn run(&self, provider: Arc<dyn TransformProvider>) -> anyhow::Result<PipeStats> {
        let codec = Codec::from_mime(&self.decoder.mime)
            .ok_or_else(|| anyhow::anyhow!("unsupported input codec: {}", self.decoder.mime))?;
        let output_codec = Codec::from_mime(&self.encoder.mime)
            .ok_or_else(|| anyhow::anyhow!("unsupported output codec: {}", self.encoder.mime))?;

        let mut filter = AnnexBFilter::new(codec);
        let codec_config = match &self.codec_config {
            Some(path) => {
                let record = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                Some(filter.filter_data(&Bytes::from(record), true))
            }
            None => None,
        };
        let input = tokio::fs::read(&self.input)
            .await
            .with_context(|| format!("reading {}", self.input.display()))?;
        let stream = filter.filter_data(&Bytes::from(input), false);
        let units = access_units(codec, &stream);
        if units.is_empty() {
            anyhow::bail!("no NAL units found in {}", self.input.display());
        }
        log::info!(
            "{}: {} access units of {}",
            self.input.display(),
            units.len(),
            codec
        );

        let decoder = Arc::new(VideoDecoder::new(provider.clone()));
        decoder.initialize(&self.decoder, codec_config.as_deref().filter(|c| !c.is_empty()))?;

        let mut stats = PipeStats {
            access_units: units.len(),
            ..Default::default()
        };

        let decoder_task = DecoderTask::new();
        let (sample_tx, sample_rx) = tokio::sync::mpsc::channel(SAMPLE_CHAN_CAP);
        let mut frames = decoder_task.start(decoder.clone(), sample_rx);

        let frame_duration = (1_000_000.0 / self.encoder.frame_rate).round() as i64;
        let feeder = tokio::spawn(feed(codec, units, frame_duration, sample_tx));

        let first = tokio::select! {
            cmd = frames.recv() => match cmd {
                Some(FrameCmd::Data(frame)) => Some(frame),
                _ => None,
            },
            _ = self.cancel.cancelled() => None,
        };
        let Some(first) = first else {
            decoder_task.stop();
            feeder.abort();
            anyhow::bail!("decoder produced no frames");
        };
        log::info!("first decoded frame: {}", first);

        let mut settings = self.encoder.clone();
        if (settings.width, settings.height) != (first.width(), first.height()) {
            log::info!(
                "encoding at the decoded size {}x{}",
                first.width(),
                first.height()
            );
            settings.width = first.width();
            settings.height = first.height();
        }
        let encoder = Arc::new(VideoEncoder::new(provider));
        encoder.initialize(&settings)?;

        let encoder_task = EncoderTask::new();
        let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(FRAME_CHAN_CAP);
        let mut samples = sample_stream(encoder_task.start(encoder.clone(), frame_rx));

        let forwarder = tokio::spawn(async move {
            let mut count = 0;
            let mut next = Some(first);
            while let Some(frame) = next {
                if frame_tx.send(FrameCmd::Data(frame)).await.is_err() {
                    return count;
                }
                count += 1;
                next = match frames.recv().await {
                    Some(FrameCmd::Data(frame)) => Some(frame),
                    _ => None,
                };
            }
            let _ = frame_tx.send(FrameCmd::EOF).await;
            count
        });

        let mut out = tokio::fs::File::create(&self.output)
            .await
            .with_context(|| format!("creating {}", self.output.display()))?;
        let mut output_filter = AnnexBFilter::new(output_codec);
        loop {
            tokio::select! {
                sample = samples.next() => {
                    let Some(sample) = sample else {
                        break;
                    };
                    let sample = output_filter.filter_sample(&sample);
                    if sample.is_key_frame() {
                        stats.key_frames += 1;
                    }
                    stats.samples += 1;
                    stats.bytes += sample.size();
                    out.write_all(sample.data()).await?;
                },
                _ = self.cancel.cancelled() => {
                    log::info!("transcode cancelled");
                    break;
                },
            }
        }
        out.flush().await?;

        decoder_task.stop();
        encoder_task.stop();
        feeder.abort();
        if self.cancel.is_cancelled() {
            forwarder.abort();
        } else {
            stats.frames = forwarder.await.unwrap_or_default();
        }
        decoder.release();
        encoder.release();
        Ok(stats)
    }
}

async fn feed(
    codec: Codec,
    units: Vec<Bytes>,
    frame_duration: i64,
    sender: SampleSender,
) {
    let mut presentation_time = 0;
    for unit in units {
        let flags = bsf::annexb_flags(codec, &unit);
        let sample = Sample::new(unit, presentation_time, flags);
        if !flags.contains(SampleFlags::CODEC_CONFIG) {
            presentation_time += frame_duration;
        }
        if sender.send(SampleCmd::Data(sample)).await.is_err() {
            return;
        }
    }
    let _ = sender.send(SampleCmd::EOF).await;
}

fn is_picture(codec: Codec, nal: &[u8]) -> bool {
    match (codec, bsf::nal_unit_type(codec, nal)) {
        (Codec::H264, Some(1..=5)) => true,
        (Codec::Hevc, Some(0..=31)) => true,
        _ => false,
    }
}

/// Whether a slice starts a new picture: `first_mb_in_slice == 0` for H.264,
/// `first_slice_segment_in_pic_flag` for HEVC.
fn is_first_slice(codec: Codec, nal: &[u8]) -> bool {
    let header_size = match codec {
        Codec::H264 => 1,
        Codec::Hevc => 2,
    };
    nal.get(header_size).is_some_and(|b| b & 0x80 != 0)
}

/// Groups the NAL units of an Annex B stream into access units. Units
/// preceding a picture (parameter sets, SEI, delimiters) belong to it.
pub(crate) fn access_units(codec: Codec, stream: &[u8]) -> Vec<Bytes> {
    let mut units = Vec::new();
    let mut current = BytesMut::new();
    let mut has_picture = false;

    for nal in bsf::split_annexb(stream).filter(|nal| !nal.is_empty()) {
        let picture = is_picture(codec, nal);
        if has_picture && (!picture || is_first_slice(codec, nal)) {
            units.push(current.split().freeze());
            has_picture = false;
        }
        current.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        current.extend_from_slice(nal);
        has_picture |= picture;
    }
    if !current.is_empty() {
        units.push(current.freeze());
    }
    units
}

#[cfg(test)]
#[path = "pipe_test.rs"]
mod pipe_test;
