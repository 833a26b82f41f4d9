// Frame Decoder
// Rebuilds JPEG frames from the raw stdout of a capture process.
//
// The stream carries no framing of its own: a frame starts with a chunk whose
// first bytes are the SOI marker and ends with a chunk whose last bytes are the
// EOI marker. Chunks that arrive while seeking and do not start a frame are dropped.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::error::{StreamError, StreamResult};

/// Bytes requested from the process per read
pub const CHUNK_SIZE: usize = 4_000;

/// Upper bound for a single frame
pub const FRAME_CAPACITY: usize = 512_000;

/// JPEG start-of-image marker (including the first byte of the next segment marker)
const SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Callback receiving each completed frame. Runs on the decoder thread.
pub type FrameCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Source of raw chunks for the decoder loop.
///
/// `read_chunk` returns the bytes currently available (up to `buf.len()`),
/// blocking until at least one byte arrives. `Ok(0)` means end of stream.
pub trait ChunkSource: Send {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<R: Read + Send> ChunkSource for R {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Two-state JPEG framing state machine
pub struct FrameDecoder {
    buffer: Vec<u8>,
    capacity: usize,
    accumulating: bool,
    frames_emitted: u64,
    chunks_discarded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity.min(64 * 1024)),
            capacity,
            accumulating: false,
            frames_emitted: 0,
            chunks_discarded: 0,
        }
    }

    /// True while a frame has been started but not yet completed
    pub fn is_accumulating(&self) -> bool {
        self.accumulating
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn chunks_discarded(&self) -> u64 {
        self.chunks_discarded
    }

    /// Feed one chunk. Returns a frame when this chunk completed one.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> StreamResult<Option<Bytes>> {
        if chunk.is_empty() {
            return Ok(None);
        }

        if !self.accumulating {
            if !chunk.starts_with(&SOI) {
                self.chunks_discarded += 1;
                return Ok(None);
            }
            self.buffer.clear();
            self.append(chunk)?;
            self.accumulating = true;

            // A whole frame inside one chunk
            if chunk.len() >= SOI.len() + EOI.len() && chunk.ends_with(&EOI) {
                return Ok(Some(self.finish_frame()));
            }
            return Ok(None);
        }

        self.append(chunk)?;
        if self.buffer.ends_with(&EOI) {
            return Ok(Some(self.finish_frame()));
        }
        Ok(None)
    }

    /// Drop any partial frame and go back to seeking
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.accumulating = false;
    }

    fn append(&mut self, chunk: &[u8]) -> StreamResult<()> {
        if self.buffer.len() + chunk.len() > self.capacity {
            self.reset();
            return Err(StreamError::FrameTooLarge {
                limit: self.capacity,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    fn finish_frame(&mut self) -> Bytes {
        let reserve = self.buffer.capacity();
        let frame = std::mem::replace(&mut self.buffer, Vec::with_capacity(reserve));
        self.accumulating = false;
        self.frames_emitted += 1;
        Bytes::from(frame)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a decoder loop ended
#[derive(Debug)]
pub enum DecoderExit {
    /// Stop was requested
    Stopped,
    /// The process closed its output
    EndOfStream,
    /// Reading or framing failed
    Failed(StreamError),
}

/// Drive `decoder` from `source` until stop, end of stream or failure.
///
/// `stop` is checked before every read. Frames are handed to `on_frame`
/// synchronously, so slow callbacks stall extraction.
pub fn run_decoder<S: ChunkSource + ?Sized>(
    source: &mut S,
    decoder: &mut FrameDecoder,
    stop: &AtomicBool,
    on_frame: &FrameCallback,
    device_id: &str,
) -> DecoderExit {
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        if stop.load(Ordering::SeqCst) {
            return DecoderExit::Stopped;
        }

        let n = match source.read_chunk(&mut chunk) {
            Ok(0) => {
                log::info!(
                    "[Stream:{}] Output ended after {} frames",
                    device_id,
                    decoder.frames_emitted()
                );
                return DecoderExit::EndOfStream;
            }
            Ok(n) => n,
            Err(e) => {
                log::warn!(
                    "[Stream:{}] Read error after {} frames: {}",
                    device_id,
                    decoder.frames_emitted(),
                    e
                );
                return DecoderExit::Failed(StreamError::Io(e));
            }
        };

        // A stop may have been requested while blocked in read
        if stop.load(Ordering::SeqCst) {
            return DecoderExit::Stopped;
        }

        match decoder.push_chunk(&chunk[..n]) {
            Ok(Some(frame)) => {
                let count = decoder.frames_emitted();
                if count <= 3 || count % 100 == 0 {
                    log::debug!("[Stream:{}] Frame {} ({} bytes)", device_id, count, frame.len());
                }
                on_frame(frame);
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("[Stream:{}] Framing failed: {}", device_id, e);
                return DecoderExit::Failed(e);
            }
        }
    }
}
