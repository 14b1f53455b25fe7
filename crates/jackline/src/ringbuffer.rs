//! Lock-free single-producer/single-consumer byte ring buffer
//!
//! The usual way to move data in and out of the process callback. Built on
//! `rtrb`: [`RingBuffer::new`] hands out one [`RingWriter`] and one
//! [`RingReader`], so the one-writer/one-reader rule is enforced by
//! ownership instead of by convention.
//!
//! The requested size is rounded up to a power of two and one byte is kept
//! free to tell "full" from "empty", so a buffer created with `new(1000)` has
//! `size() == 1024` and accepts at most 1023 bytes.

use rtrb::chunks::{ReadChunk, WriteChunk};

use crate::error::{Error, Result};

/// Constructor namespace for ring buffer halves
pub struct RingBuffer;

impl RingBuffer {
    /// Create a ring buffer of at least `size` bytes
    pub fn new(size: usize) -> Result<(RingWriter, RingReader)> {
        let size = size
            .max(2)
            .checked_next_power_of_two()
            .ok_or(Error::Operation {
                op: "ringbuffer create",
                code: -1,
            })?;
        let (producer, consumer) = rtrb::RingBuffer::<u8>::new(size - 1);
        Ok((
            RingWriter { producer, size },
            RingReader { consumer, size },
        ))
    }
}

/// Writing half
pub struct RingWriter {
    producer: rtrb::Producer<u8>,
    size: usize,
}

impl RingWriter {
    /// Bytes that can be written right now
    pub fn write_space(&self) -> usize {
        self.producer.slots()
    }

    /// Total size (a power of two)
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy as much of `data` as fits; returns the number of bytes written
    pub fn write(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.producer.slots());
        if count == 0 {
            return 0;
        }
        match self.producer.write_chunk(count) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&data[..split]);
                second.copy_from_slice(&data[split..count]);
                chunk.commit_all();
                count
            }
            Err(_) => 0,
        }
    }

    /// Direct access to all writable space as up to two slices
    ///
    /// Nothing becomes visible to the reader until
    /// [`WriteRegions::advance`] is called.
    pub fn write_buffers(&mut self) -> WriteRegions<'_> {
        let slots = self.producer.slots();
        WriteRegions {
            chunk: self.producer.write_chunk(slots).ok(),
        }
    }

    /// True if the reader was dropped
    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }
}

/// Writable regions of a ring buffer
pub struct WriteRegions<'a> {
    chunk: Option<WriteChunk<'a, u8>>,
}

impl WriteRegions<'_> {
    pub fn as_mut_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        match self.chunk.as_mut() {
            Some(chunk) => chunk.as_mut_slices(),
            None => (Default::default(), Default::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.chunk.as_ref().map_or(0, |chunk| chunk.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish the first `count` bytes (clamped to the region size)
    pub fn advance(self, count: usize) {
        if let Some(chunk) = self.chunk {
            let count = count.min(chunk.len());
            chunk.commit(count);
        }
    }
}

/// Reading half
pub struct RingReader {
    consumer: rtrb::Consumer<u8>,
    size: usize,
}

impl RingReader {
    /// Bytes available for reading
    pub fn read_space(&self) -> usize {
        self.consumer.slots()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn copy_out(&mut self, out: &mut [u8], consume: bool) -> usize {
        let count = out.len().min(self.consumer.slots());
        if count == 0 {
            return 0;
        }
        match self.consumer.read_chunk(count) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..count].copy_from_slice(second);
                if consume {
                    chunk.commit_all();
                }
                count
            }
            Err(_) => 0,
        }
    }

    /// Move up to `out.len()` bytes out of the buffer
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.copy_out(out, true)
    }

    /// Copy up to `out.len()` bytes without consuming them
    pub fn peek(&mut self, out: &mut [u8]) -> usize {
        self.copy_out(out, false)
    }

    /// Direct access to all readable data as up to two slices
    pub fn read_buffers(&mut self) -> ReadRegions<'_> {
        let slots = self.consumer.slots();
        ReadRegions {
            chunk: self.consumer.read_chunk(slots).ok(),
        }
    }

    /// Discard `count` readable bytes (clamped); returns how many were dropped
    pub fn read_advance(&mut self, count: usize) -> usize {
        let count = count.min(self.consumer.slots());
        match self.consumer.read_chunk(count) {
            Ok(chunk) => {
                chunk.commit_all();
                count
            }
            Err(_) => 0,
        }
    }

    /// Drop everything currently readable
    pub fn reset(&mut self) {
        let pending = self.read_space();
        self.read_advance(pending);
    }

    /// True if the writer was dropped
    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }
}

/// Readable regions of a ring buffer
pub struct ReadRegions<'a> {
    chunk: Option<ReadChunk<'a, u8>>,
}

impl ReadRegions<'_> {
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        match self.chunk.as_ref() {
            Some(chunk) => chunk.as_slices(),
            None => (Default::default(), Default::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.chunk.as_ref().map_or(0, |chunk| chunk.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the first `count` bytes (clamped to the region size)
    pub fn advance(self, count: usize) {
        if let Some(chunk) = self.chunk {
            let count = count.min(chunk.len());
            chunk.commit(count);
        }
    }
}
