use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Fixed-capacity byte ring. Pushing past capacity discards the oldest bytes.
#[derive(Debug)]
pub struct LogRing {
    buf: VecDeque<u8>,
    cap: usize,
    discarded: u64,
}

impl LogRing {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(64 * 1024)),
            cap,
            discarded: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.cap == 0 {
            self.discarded += bytes.len() as u64;
            return;
        }
        // Only the last `cap` bytes of an oversized write can survive.
        let bytes = if bytes.len() > self.cap {
            self.discarded += (bytes.len() - self.cap) as u64;
            &bytes[bytes.len() - self.cap..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.discarded += overflow as u64;
        }
        self.buf.extend(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes dropped so far to respect the cap.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Current contents, lossily decoded.
    pub fn tail(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// stdout + stderr rings of one child run, shared with the pipe reader tasks.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub stdout: Arc<Mutex<LogRing>>,
    pub stderr: Arc<Mutex<LogRing>>,
}

impl CapturedOutput {
    pub fn new(cap: usize) -> Self {
        Self {
            stdout: Arc::new(Mutex::new(LogRing::new(cap))),
            stderr: Arc::new(Mutex::new(LogRing::new(cap))),
        }
    }

    /// `(stdout_tail, stderr_tail)`.
    pub fn tails(&self) -> (String, String) {
        (read_tail(&self.stdout), read_tail(&self.stderr))
    }

    pub fn stderr_tail(&self) -> String {
        read_tail(&self.stderr)
    }
}

fn read_tail(ring: &Mutex<LogRing>) -> String {
    // A reader task that panicked mid-push leaves a usable buffer behind.
    match ring.lock() {
        Ok(guard) => guard.tail(),
        Err(poisoned) => poisoned.into_inner().tail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_cap() {
        let mut ring = LogRing::new(16);
        ring.push(b"hello ");
        ring.push(b"world");
        assert_eq!(ring.tail(), "hello world");
        assert_eq!(ring.discarded(), 0);
    }

    #[test]
    fn drops_oldest_bytes_first() {
        let mut ring = LogRing::new(8);
        ring.push(b"abcdef");
        ring.push(b"ghij");
        assert_eq!(ring.tail(), "cdefghij");
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.discarded(), 2);
    }

    #[test]
    fn oversized_write_keeps_its_own_tail() {
        let mut ring = LogRing::new(4);
        ring.push(b"xy");
        ring.push(b"0123456789");
        assert_eq!(ring.tail(), "6789");
        assert_eq!(ring.discarded(), 8);
    }

    #[test]
    fn zero_cap_stores_nothing() {
        let mut ring = LogRing::new(0);
        ring.push(b"abc");
        assert!(ring.is_empty());
        assert_eq!(ring.discarded(), 3);
    }
}
