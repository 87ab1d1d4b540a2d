use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;

use crate::convert::{PixelConverter, TargetImage};
use crate::encoder::{EncoderTask, MAX_FRAME_RATE, Settings, VideoEncoder};
use crate::error::SessionError;
use crate::frame::{Frame, FrameCmd, PixelFormat};
use crate::packet::sample_stream;
use crate::mock::{Bt601Converter, Echo, MockProvider, Output, Script, StreamChange, inspect};
use crate::packet::{Sample, SampleCmd};
use crate::session::SessionState;
use crate::transform::{Codec, ControlMessage, MediaType, Subtype};

const HEADER: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE];

fn settings(width: u32, height: u32) -> Settings {
    Settings {
        width,
        height,
        ..Settings::default()
    }
}

fn white(width: u32, height: u32) -> Frame {
    Frame::new(
        PixelFormat::Rgb24,
        width,
        height,
        vec![255u8; (width * height * 3) as usize],
    )
    .unwrap()
}

fn test_encoder(script: &Arc<Mutex<Script>>) -> VideoEncoder {
    VideoEncoder::with_converter(MockProvider::new(script.clone()), Arc::new(Bt601Converter))
}

fn started_encoder(script: Script, width: u32, height: u32) -> (VideoEncoder, Arc<Mutex<Script>>) {
    let script = script.shared();
    let encoder = test_encoder(&script);
    encoder.initialize(&settings(width, height)).unwrap();
    encoder.start().unwrap();
    (encoder, script)
}

fn encoding_script(width: u32, height: u32, key_interval: usize) -> Script {
    Script {
        echo: Echo::Encoded { key_interval },
        sequence_header: Some(Bytes::from_static(HEADER)),
        ..Script::encoder(width, height)
    }
}

fn drain(encoder: &VideoEncoder) -> Vec<Sample> {
    std::iter::from_fn(|| encoder.pop_sample()).collect()
}

#[test]
fn test_gop_size() {
    let mut settings = Settings::default();
    assert_eq!(settings.gop_size(), 30);
    settings.iframe_interval = 0;
    assert_eq!(settings.gop_size(), 1);
    settings.iframe_interval = -1;
    assert_eq!(settings.gop_size(), u32::MAX);
    settings.iframe_interval = 2;
    settings.frame_rate = 29.97;
    assert_eq!(settings.gop_size(), 60);
    settings.frame_rate = 0.2;
    assert_eq!(settings.gop_size(), 1);
}

#[test]
fn test_negotiation() {
    let (encoder, script) = started_encoder(Script::encoder(64, 48), 64, 48);
    assert_eq!(encoder.codec(), Some(Codec::H264));

    let script = inspect(&script);
    let input = script.input_type.as_ref().unwrap();
    assert_eq!(input.subtype, Subtype::Raw(PixelFormat::Nv12));
    assert_eq!((input.width, input.height), (64, 48));
    assert_eq!(input.frame_rate, Some((30_000, 1_000)));
    assert!(input.progressive);
    assert_eq!(input.default_stride, Some(64));

    let output = script.output_type.as_ref().unwrap();
    assert_eq!(output.subtype, Subtype::Encoded(Codec::H264));
    assert_eq!(output.bitrate, Some(2_000_000));
    assert_eq!(script.gop_size, Some(30));
    assert_eq!(
        script.messages,
        vec![
            ControlMessage::Flush,
            ControlMessage::BeginStreaming,
            ControlMessage::StartOfStream
        ]
    );
}

#[test]
fn test_synthesized_input_type() {
    let (_encoder, script) = started_encoder(Script::default(), 40, 8);
    let script = inspect(&script);
    let input = script.input_type.as_ref().unwrap();
    assert_eq!(input.subtype, Subtype::Raw(PixelFormat::Nv12));
    assert_eq!(input.default_stride, Some(64));
    assert_eq!(input.frame_rate, Some((30_000, 1_000)));
}

#[test]
fn test_invalid_settings() {
    let script = Script::encoder(64, 48).shared();
    let encoder = test_encoder(&script);

    for bad in [
        Settings {
            bitrate: 0,
            ..settings(64, 48)
        },
        Settings {
            bitrate: 100_000_001,
            ..settings(64, 48)
        },
        Settings {
            frame_rate: 0.0,
            ..settings(64, 48)
        },
        Settings {
            frame_rate: f64::NAN,
            ..settings(64, 48)
        },
        Settings {
            frame_rate: 1e12,
            ..settings(64, 48)
        },
        Settings {
            frame_rate: 0.0001,
            ..settings(64, 48)
        },
        settings(20_000, 48),
    ] {
        assert!(matches!(
            encoder.initialize(&bad),
            Err(SessionError::InvalidParameter(_))
        ));
    }
    assert!(matches!(
        encoder.initialize(&Settings {
            mime: "audio/aac".to_string(),
            ..settings(64, 48)
        }),
        Err(SessionError::UnsupportedFormat(_))
    ));
    assert_eq!(encoder.state(), SessionState::Uninitialized);
    assert_eq!(inspect(&script).startups, 0);
}

#[test]
fn test_gop_failure_is_not_fatal() {
    let script = Script {
        gop_supported: false,
        ..Script::encoder(64, 48)
    };
    let (encoder, script) = started_encoder(script, 64, 48);
    assert!(encoder.is_started());
    assert_eq!(inspect(&script).gop_size, None);
}

#[test]
fn test_encode_with_config_sample() {
    let (encoder, script) = started_encoder(encoding_script(64, 48, 3), 64, 48);

    for i in 0..4i64 {
        encoder.push_frame(&white(64, 48), i * 33_333).unwrap();
    }
    let samples = drain(&encoder);

    let summary: Vec<(bool, bool, i64)> = samples
        .iter()
        .map(|s| (s.is_configuration(), s.is_key_frame(), s.presentation_time()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (true, false, 0),
            (false, true, 0),
            (false, false, 33_333),
            (false, false, 66_666),
            (false, true, 99_999),
        ]
    );
    assert_eq!(&samples[0].data()[..], HEADER);

    let script = inspect(&script);
    let (data, time, duration) = &script.inputs[0];
    assert_eq!(data.len(), 64 * 48 * 3 / 2);
    assert!(data[..64 * 48].iter().all(|&y| y == 235));
    assert!(data[64 * 48..].iter().all(|&c| c == 128));
    assert_eq!(*time, Some(0));
    assert_eq!(*duration, Some(333_333));
}

#[test]
fn test_padded_input_stride() {
    let (encoder, script) = started_encoder(Script::encoder(40, 4), 40, 4);
    encoder.push_frame(&white(40, 4), 0).unwrap();

    let script = inspect(&script);
    let data = &script.inputs[0].0;
    assert_eq!(data.len(), 64 * 4 + 64 * 2);
    assert!(data[..40].iter().all(|&y| y == 235));
    assert!(data[40..64].iter().all(|&pad| pad == 0));
    assert!(data[256..296].iter().all(|&c| c == 128));
}

#[test]
fn test_dimension_mismatch() {
    let (encoder, script) = started_encoder(Script::encoder(64, 48), 64, 48);
    assert!(matches!(
        encoder.push_frame(&white(32, 48), 0),
        Err(SessionError::DimensionMismatch {
            got_width: 32,
            width: 64,
            ..
        })
    ));
    assert!(inspect(&script).inputs.is_empty());
}

struct FailingConverter;

impl PixelConverter for FailingConverter {
    fn convert(&self, _source: &Frame, _target: &mut TargetImage<'_>) -> anyhow::Result<()> {
        anyhow::bail!("no conversion path")
    }
}

#[test]
fn test_conversion_failure() {
    let script = Script::encoder(64, 48).shared();
    let encoder =
        VideoEncoder::with_converter(MockProvider::new(script.clone()), Arc::new(FailingConverter));
    encoder.initialize(&settings(64, 48)).unwrap();
    encoder.start().unwrap();

    assert!(matches!(
        encoder.push_frame(&white(64, 48), 0),
        Err(SessionError::ConversionFailed(_))
    ));
}

#[test]
fn test_push_before_start() {
    let script = Script::encoder(64, 48).shared();
    let encoder = test_encoder(&script);
    assert!(matches!(
        encoder.push_frame(&white(64, 48), 0),
        Err(SessionError::InvalidState { .. })
    ));
    assert!(encoder.pop_sample().is_none());
    assert!(matches!(
        encoder.request_key_frame(),
        Err(SessionError::InvalidState { .. })
    ));
}

#[test]
fn test_backpressure_retries_once() {
    let (encoder, script) = started_encoder(
        Script {
            not_accepting: 1,
            ..encoding_script(64, 48, 1)
        },
        64,
        48,
    );
    encoder.push_frame(&white(64, 48), 0).unwrap();
    assert_eq!(inspect(&script).inputs.len(), 1);

    inspect(&script).not_accepting = 2;
    assert!(matches!(
        encoder.push_frame(&white(64, 48), 1),
        Err(SessionError::NotAccepting)
    ));
    assert_eq!(inspect(&script).inputs.len(), 1);
}

#[test]
fn test_stop_marks_end_of_stream() {
    let (encoder, script) = started_encoder(
        Script {
            hold_until_drain: true,
            ..encoding_script(64, 48, 2)
        },
        64,
        48,
    );
    for i in 0..3i64 {
        encoder.push_frame(&white(64, 48), i).unwrap();
    }
    assert!(encoder.pop_sample().is_none());

    encoder.stop();
    assert_eq!(encoder.state(), SessionState::Stopped);
    let samples = drain(&encoder);
    assert_eq!(samples.len(), 4);
    assert!(samples[0].is_configuration());
    assert!(samples.last().unwrap().is_end_of_stream());
    assert!(samples[..3].iter().all(|s| !s.is_end_of_stream()));

    let messages = inspect(&script).messages.clone();
    assert_eq!(
        &messages[messages.len() - 3..],
        &[
            ControlMessage::Drain,
            ControlMessage::EndOfStream,
            ControlMessage::EndStreaming
        ]
    );
}

#[test]
fn test_config_repeats_per_epoch() {
    let (encoder, _script) = started_encoder(encoding_script(64, 48, 1), 64, 48);
    for i in 0..3i64 {
        encoder.push_frame(&white(64, 48), i).unwrap();
    }
    let first = drain(&encoder);
    assert_eq!(first.iter().filter(|s| s.is_configuration()).count(), 1);
    assert_eq!(first.iter().filter(|s| s.is_key_frame()).count(), 3);

    encoder.stop();
    encoder.start().unwrap();
    encoder.push_frame(&white(64, 48), 10).unwrap();
    let second = drain(&encoder);
    assert!(second[0].is_configuration());
    assert!(second[1].is_key_frame());
}

#[test]
fn test_stream_change_repeats_config() {
    let (encoder, script) = started_encoder(encoding_script(64, 48, 1), 64, 48);
    encoder.push_frame(&white(64, 48), 0).unwrap();
    assert_eq!(drain(&encoder).len(), 2);

    {
        let mut script = inspect(&script);
        let encoded = script.output_type.clone().unwrap();
        script.stream_change = Some(StreamChange {
            output_types: vec![MediaType {
                width: 32,
                ..encoded
            }],
            provides_samples: true,
            size_hint: 0,
        });
        script.outputs.push_back(Output::StreamChanged);
        script.outputs.push_back(Output::Ready {
            data: vec![0, 0, 0, 1, 0x65, 0xFF],
            time: 400_000,
            key: true,
        });
    }

    let samples = drain(&encoder);
    assert_eq!(samples.len(), 2);
    assert!(samples[0].is_configuration());
    assert_eq!(samples[1].presentation_time(), 40_000);
    assert_eq!(inspect(&script).output_type.as_ref().unwrap().width, 32);
}

#[test]
fn test_request_key_frame() {
    let (encoder, script) = started_encoder(Script::encoder(64, 48), 64, 48);
    encoder.request_key_frame().unwrap();
    assert_eq!(inspect(&script).key_frame_requests, 1);
}

#[test]
fn test_release() {
    let (encoder, script) = started_encoder(encoding_script(64, 48, 1), 64, 48);
    encoder.push_frame(&white(64, 48), 0).unwrap();
    encoder.release();

    assert_eq!(encoder.state(), SessionState::Released);
    assert!(encoder.pop_sample().is_none());
    assert!(matches!(
        encoder.start(),
        Err(SessionError::InvalidState { .. })
    ));
    drop(encoder);
    assert_eq!(inspect(&script).shutdowns, 1);
}

#[test]
fn test_frame_rate_limits() {
    for frame_rate in [0.001, MAX_FRAME_RATE] {
        let script = Script::encoder(64, 48).shared();
        let encoder = test_encoder(&script);
        encoder
            .initialize(&Settings {
                frame_rate,
                ..settings(64, 48)
            })
            .unwrap();
        let input = inspect(&script).input_type.clone().unwrap();
        assert_eq!(
            input.frame_rate,
            Some(((frame_rate * 1000.0).round() as u32, 1000))
        );
    }
}

#[test]
fn test_push_after_release() {
    let (encoder, script) = started_encoder(encoding_script(64, 48, 1), 64, 48);
    encoder.release();

    assert!(matches!(
        encoder.push_frame(&white(64, 48), 0),
        Err(SessionError::InvalidState { .. })
    ));
    assert!(inspect(&script).inputs.is_empty());
}

#[test]
fn test_start_twice_sends_nothing() {
    let (encoder, script) = started_encoder(encoding_script(64, 48, 1), 64, 48);
    let messages = inspect(&script).messages.clone();

    encoder.start().unwrap();
    assert_eq!(encoder.state(), SessionState::Started);
    assert_eq!(inspect(&script).messages, messages);
}

#[test]
fn test_presentation_time_out_of_range() {
    let (encoder, script) = started_encoder(encoding_script(64, 48, 1), 64, 48);
    assert!(matches!(
        encoder.push_frame(&white(64, 48), i64::MAX / 2),
        Err(SessionError::InvalidParameter(_))
    ));
    assert!(inspect(&script).inputs.is_empty());
    assert_eq!(encoder.state(), SessionState::Started);
}

#[tokio::test]
async fn test_encoder_task() -> anyhow::Result<()> {
    let script = encoding_script(16, 16, 2).shared();
    let encoder = Arc::new(test_encoder(&script));
    encoder.initialize(&settings(16, 16))?;

    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(4);
    let task = EncoderTask::new();
    let mut samples = sample_stream(task.start(encoder.clone(), frame_rx));

    for i in 0..4i64 {
        frame_tx
            .send(FrameCmd::Data(white(16, 16).with_presentation_time(i * 1_000)))
            .await?;
    }
    frame_tx.send(FrameCmd::EOF).await?;

    let mut received = Vec::new();
    while let Some(sample) = samples.next().await {
        received.push(sample);
    }
    assert_eq!(received.len(), 5);
    assert!(received[0].is_configuration());
    assert!(received[1].is_key_frame());
    assert!(received[3].is_key_frame());
    assert_eq!(received[4].presentation_time(), 3_000);
    Ok(())
}

#[tokio::test]
async fn test_encoder_task_slow_consumer_loses_nothing() -> anyhow::Result<()> {
    let script = encoding_script(16, 16, 30).shared();
    let encoder = Arc::new(test_encoder(&script));
    encoder.initialize(&settings(16, 16))?;

    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(1);
    let task = EncoderTask::with_capacity(1);
    let mut samples = task.start(encoder.clone(), frame_rx);

    let producer = tokio::spawn(async move {
        for i in 0..300i64 {
            let frame = white(16, 16).with_presentation_time(i * 1_000);
            if frame_tx.send(FrameCmd::Data(frame)).await.is_err() {
                return;
            }
        }
        let _ = frame_tx.send(FrameCmd::EOF).await;
    });

    let mut times = Vec::new();
    while let Some(cmd) = samples.recv().await {
        let SampleCmd::Data(sample) = cmd else {
            break;
        };
        if !sample.is_configuration() {
            times.push(sample.presentation_time());
        }
        tokio::task::yield_now().await;
    }
    producer.await?;

    assert_eq!(times.len(), 300);
    assert!(times.windows(2).all(|w| w[1] == w[0] + 1_000));
    Ok(())
}
