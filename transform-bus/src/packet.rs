use std::fmt::{Display, Formatter};
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_stream::wrappers::ReceiverStream;

/// Bounded; a full channel blocks the producer.
pub type SampleSender = tokio::sync::mpsc::Sender<SampleCmd>;
pub type SampleReceiver = tokio::sync::mpsc::Receiver<SampleCmd>;

#[derive(Clone, Debug)]
pub enum SampleCmd {
    Data(Sample),
    EOF,
}

/// Samples of `receiver` up to end of stream.
pub fn sample_stream(receiver: SampleReceiver) -> BoxStream<'static, Sample> {
    ReceiverStream::new(receiver)
        .take_while(|cmd| futures::future::ready(matches!(cmd, SampleCmd::Data(_))))
        .filter_map(|cmd| async move {
            match cmd {
                SampleCmd::Data(sample) => Some(sample),
                SampleCmd::EOF => None,
            }
        })
        .boxed()
}

/// Independent properties of an encoded sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    /// Codec initialization data (parameter sets) instead of media data.
    pub const CODEC_CONFIG: Self = Self(2);
    pub const END_OF_STREAM: Self = Self(4);
    pub const PARTIAL_FRAME: Self = Self(8);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for SampleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SampleFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// An encoded elementary stream unit.
#[derive(Clone, Debug, Default)]
pub struct Sample {
    data: Bytes,
    presentation_time: i64,
    flags: SampleFlags,
}

impl Sample {
    pub fn new(data: impl Into<Bytes>, presentation_time: i64, flags: SampleFlags) -> Self {
        Self {
            data: data.into(),
            presentation_time,
            flags,
        }
    }

    /// A sample with an empty payload carries nothing and is invalid.
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Presentation time in microseconds.
    pub fn presentation_time(&self) -> i64 {
        self.presentation_time
    }

    pub fn flags(&self) -> SampleFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: SampleFlags) {
        self.flags = flags;
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(SampleFlags::KEY_FRAME)
    }

    pub fn is_configuration(&self) -> bool {
        self.flags.contains(SampleFlags::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(SampleFlags::END_OF_STREAM)
    }

    pub fn is_partial_frame(&self) -> bool {
        self.flags.contains(SampleFlags::PARTIAL_FRAME)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Sample data_len: {}, pts: {}, key: {}, config: {}, eos: {}",
            self.data.len(),
            self.presentation_time,
            self.is_key_frame(),
            self.is_configuration(),
            self.is_end_of_stream()
        )
    }
}
