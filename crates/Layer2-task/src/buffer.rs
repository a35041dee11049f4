//! Fixed-capacity output ring
//!
//! Every execution mode pipes each stream into one `CircularBuffer`, so the
//! memory held for a process is bounded no matter how much it prints. Once
//! full, the oldest bytes are overwritten and `read()` still yields the most
//! recent `capacity` bytes in the order they were written.

use parking_lot::Mutex;
use std::sync::Arc;

/// Buffer shared between a reader task and whoever snapshots it
pub type SharedBuffer = Arc<Mutex<CircularBuffer>>;

#[derive(Debug, Clone)]
pub struct CircularBuffer {
    /// Grows up to `capacity`, then is overwritten in place
    data: Vec<u8>,
    capacity: usize,
    /// Next write position
    cursor: usize,
    wrapped: bool,
    total_written: u64,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            cursor: 0,
            wrapped: false,
            total_written: 0,
        }
    }

    pub fn shared(capacity: usize) -> SharedBuffer {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// Append bytes, overwriting the oldest data when full
    pub fn write(&mut self, bytes: &[u8]) {
        self.total_written += bytes.len() as u64;
        if self.capacity == 0 || bytes.is_empty() {
            return;
        }

        // Chunk at least as large as the ring: only its tail survives
        if bytes.len() >= self.capacity {
            let tail = &bytes[bytes.len() - self.capacity..];
            self.data.clear();
            self.data.extend_from_slice(tail);
            self.cursor = 0;
            self.wrapped = true;
            return;
        }

        let mut input = bytes;

        if self.data.len() < self.capacity {
            let take = (self.capacity - self.data.len()).min(input.len());
            self.data.extend_from_slice(&input[..take]);
            self.cursor = self.data.len();
            input = &input[take..];

            if self.cursor == self.capacity {
                self.cursor = 0;
                self.wrapped = true;
            }
        }

        while !input.is_empty() {
            let take = (self.capacity - self.cursor).min(input.len());
            self.data[self.cursor..self.cursor + take].copy_from_slice(&input[..take]);
            self.cursor = (self.cursor + take) % self.capacity;
            input = &input[take..];
            self.wrapped = true;
        }
    }

    /// Retained bytes in chronological order
    pub fn read(&self) -> Vec<u8> {
        if !self.wrapped {
            return self.data[..self.cursor].to_vec();
        }

        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(&self.data[self.cursor..]);
        out.extend_from_slice(&self.data[..self.cursor]);
        out
    }

    /// Bytes written after `mark` (a previous `total_written()` value).
    ///
    /// The flag is true when part of that range has already been
    /// overwritten; the returned bytes are then everything still retained.
    pub fn read_since(&self, mark: u64) -> (Vec<u8>, bool) {
        if mark >= self.total_written {
            return (Vec::new(), false);
        }

        let oldest = self.total_written - self.len() as u64;
        if mark < oldest {
            return (self.read(), true);
        }

        let skip = (mark - oldest) as usize;
        let mut bytes = self.read();
        bytes.drain(..skip);
        (bytes, false)
    }

    /// Retained text, lossily decoded
    pub fn read_string(&self) -> String {
        String::from_utf8_lossy(&self.read()).into_owned()
    }

    pub fn len(&self) -> usize {
        if self.wrapped {
            self.capacity
        } else {
            self.cursor
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Bytes ever written, including dropped ones
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Whether any written byte has been dropped
    pub fn is_truncated(&self) -> bool {
        self.total_written > self.capacity as u64
    }
}
