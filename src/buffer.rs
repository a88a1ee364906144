//! Bounded record of a session's recent output and input.

use std::collections::VecDeque;

use bytes::Bytes;

/// Append-only output ring, bounded by total bytes. Whole chunks are evicted
/// oldest first; a single chunk larger than the bound keeps only its tail.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
    capacity: usize,
    total: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.total += chunk.len() as u64;
        if self.capacity == 0 || chunk.is_empty() {
            return;
        }
        let chunk = if chunk.len() > self.capacity {
            chunk.slice(chunk.len() - self.capacity..)
        } else {
            chunk
        };
        self.len += chunk.len();
        self.chunks.push_back(chunk);
        while self.len > self.capacity {
            match self.chunks.pop_front() {
                Some(old) => self.len -= old.len(),
                None => break,
            }
        }
    }

    /// Bytes currently retained.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes ever pushed, including evicted ones.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Retained output as text. Invalid or cut-off UTF-8 is replaced.
    pub fn recent_text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

/// Lines typed into a session, newest last. Input is split on carriage
/// return or newline; a partial line waits for its terminator.
#[derive(Debug, Clone)]
pub struct InputHistory {
    lines: VecDeque<String>,
    partial: Vec<u8>,
    limit: usize,
}

/// Cap on an unterminated line so binary input cannot grow it forever.
const MAX_PARTIAL_LINE: usize = 4096;

impl InputHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: Vec::new(),
            limit,
        }
    }

    pub fn record(&mut self, data: &[u8]) {
        for &b in data {
            match b {
                b'\r' | b'\n' => self.finish_line(),
                // Backspace / DEL edit the pending line.
                0x08 | 0x7f => {
                    self.partial.pop();
                }
                b if b < 0x20 => {}
                b => {
                    if self.partial.len() < MAX_PARTIAL_LINE {
                        self.partial.push(b);
                    }
                }
            }
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    fn finish_line(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.partial).trim().to_string();
        self.partial.clear();
        if line.is_empty() || self.limit == 0 {
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}
