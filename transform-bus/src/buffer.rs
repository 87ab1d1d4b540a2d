//! Native buffer access.
//!
//! Transforms exchange data through [`MediaBuffer`] objects which must be
//! locked before their memory is touched. The lock is only ever taken through
//! [`BufferLock`] / [`Buffer2DLock`], which unlock again when dropped, so an
//! early return can never leave a buffer locked.

use std::ops::{Deref, DerefMut};

use crate::error::TransformError;

/// A buffer owned by (or handed to) a transform.
pub trait MediaBuffer: Send {
    /// Total number of bytes the buffer can hold.
    fn capacity(&self) -> usize;

    /// Number of valid bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_len(&mut self, len: usize) -> Result<(), TransformError>;

    fn lock(&mut self) -> Result<(), TransformError>;

    fn unlock(&mut self);

    /// Whole backing memory, `capacity()` bytes. Only meaningful while locked.
    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];

    /// Pitch-aware view, if the buffer holds an image with padded rows.
    fn as_2d(&mut self) -> Option<&mut dyn MediaBuffer2D> {
        None
    }
}

/// Pitch-aware view of an image buffer.
pub trait MediaBuffer2D {
    /// Locks the buffer and returns the row pitch in bytes. Rows are top-down.
    fn lock_2d(&mut self) -> Result<usize, TransformError>;

    fn unlock_2d(&mut self);

    /// Scanline memory starting at the first row. Only meaningful while locked.
    fn scanlines(&self) -> &[u8];
}

/// Scoped flat lock of a [`MediaBuffer`].
pub struct BufferLock<'a> {
    buffer: &'a mut dyn MediaBuffer,
}

impl<'a> BufferLock<'a> {
    pub fn acquire(buffer: &'a mut dyn MediaBuffer) -> Result<Self, TransformError> {
        buffer.lock()?;
        Ok(Self { buffer })
    }

    /// The valid bytes, `len()` of the underlying buffer.
    pub fn data(&self) -> &[u8] {
        let memory = self.buffer.memory();
        &memory[..self.buffer.len().min(memory.len())]
    }

    pub fn set_len(&mut self, len: usize) -> Result<(), TransformError> {
        self.buffer.set_len(len)
    }
}

impl Deref for BufferLock<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.memory()
    }
}

impl DerefMut for BufferLock<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.memory_mut()
    }
}

impl Drop for BufferLock<'_> {
    fn drop(&mut self) {
        self.buffer.unlock();
    }
}

/// Scoped 2-D lock of a [`MediaBuffer2D`].
pub struct Buffer2DLock<'a> {
    buffer: &'a mut dyn MediaBuffer2D,
    pitch: usize,
}

impl<'a> Buffer2DLock<'a> {
    pub fn acquire(buffer: &'a mut dyn MediaBuffer2D) -> Result<Self, TransformError> {
        let pitch = buffer.lock_2d()?;
        Ok(Self { buffer, pitch })
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn scanlines(&self) -> &[u8] {
        self.buffer.scanlines()
    }
}

impl Drop for Buffer2DLock<'_> {
    fn drop(&mut self) {
        self.buffer.unlock_2d();
    }
}

/// Heap backed [`MediaBuffer`], optionally exposing a 2-D view.
#[derive(Debug, Default)]
pub struct MemoryBuffer {
    memory: Vec<u8>,
    len: usize,
    pitch: Option<usize>,
    locks: usize,
}

impl MemoryBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            memory: vec![0; capacity],
            ..Default::default()
        }
    }

    /// Buffer holding a copy of `data`, with `len() == data.len()`.
    pub fn copy_from(data: &[u8]) -> Self {
        Self {
            memory: data.to_vec(),
            len: data.len(),
            ..Default::default()
        }
    }

    /// Image buffer whose rows are `pitch` bytes apart.
    pub fn with_pitch(memory: Vec<u8>, pitch: usize) -> Self {
        let len = memory.len();
        Self {
            memory,
            len,
            pitch: Some(pitch),
            locks: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locks > 0
    }
}

impl MediaBuffer for MemoryBuffer {
    fn capacity(&self) -> usize {
        self.memory.len()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn set_len(&mut self, len: usize) -> Result<(), TransformError> {
        if len > self.memory.len() {
            return Err(TransformError::BufferTooSmall {
                needed: len,
                have: self.memory.len(),
            });
        }
        self.len = len;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), TransformError> {
        self.locks += 1;
        Ok(())
    }

    fn unlock(&mut self) {
        self.locks = self.locks.saturating_sub(1);
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn as_2d(&mut self) -> Option<&mut dyn MediaBuffer2D> {
        match self.pitch {
            Some(_) => Some(self),
            None => None,
        }
    }
}

impl MediaBuffer2D for MemoryBuffer {
    fn lock_2d(&mut self) -> Result<usize, TransformError> {
        let pitch = self.pitch.ok_or(TransformError::Unsupported)?;
        self.locks += 1;
        Ok(pitch)
    }

    fn unlock_2d(&mut self) {
        self.locks = self.locks.saturating_sub(1);
    }

    fn scanlines(&self) -> &[u8] {
        &self.memory
    }
}

/// One unit of data crossing the transform boundary.
///
/// Times are in the transform's native unit (100 ns).
pub struct TransformSample {
    buffer: Box<dyn MediaBuffer>,
    time: Option<i64>,
    duration: Option<i64>,
    clean_point: bool,
}

impl TransformSample {
    pub fn new(buffer: impl MediaBuffer + 'static) -> Self {
        Self {
            buffer: Box::new(buffer),
            time: None,
            duration: None,
            clean_point: false,
        }
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_clean_point(mut self, clean_point: bool) -> Self {
        self.clean_point = clean_point;
        self
    }

    pub fn time(&self) -> Option<i64> {
        self.time
    }

    pub fn set_time(&mut self, time: Option<i64>) {
        self.time = time;
    }

    pub fn duration(&self) -> Option<i64> {
        self.duration
    }

    pub fn is_clean_point(&self) -> bool {
        self.clean_point
    }

    pub fn set_clean_point(&mut self, clean_point: bool) {
        self.clean_point = clean_point;
    }

    pub fn buffer(&self) -> &dyn MediaBuffer {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> &mut dyn MediaBuffer {
        self.buffer.as_mut()
    }

    /// Copies the valid bytes out of the buffer.
    pub fn to_vec(&mut self) -> Result<Vec<u8>, TransformError> {
        let lock = BufferLock::acquire(self.buffer.as_mut())?;
        Ok(lock.data().to_vec())
    }
}

impl std::fmt::Debug for TransformSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformSample")
            .field("len", &self.buffer.len())
            .field("time", &self.time)
            .field("duration", &self.duration)
            .field("clean_point", &self.clean_point)
            .finish()
    }
}
