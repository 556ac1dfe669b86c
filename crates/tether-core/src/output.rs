//! Bounded, shareable text buffers used to capture script and feedback output.

use std::sync::{Arc, Mutex, MutexGuard};

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

#[derive(Debug)]
struct Inner {
    text: String,
    limit: usize,
    truncated: bool,
}

/// Append-only text buffer with a byte cap.
///
/// Clones share the same storage. Once the cap is reached further writes are
/// dropped and a single truncation marker is appended.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl OutputBuffer {
    /// Create an empty buffer holding at most `limit` bytes of payload.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                text: String::new(),
                limit,
                truncated: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the text intact.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append text, truncating at a UTF-8 boundary once the cap is hit.
    pub fn push(&self, s: &str) {
        let mut inner = self.lock();
        if inner.truncated {
            return;
        }
        let room = inner.limit.saturating_sub(inner.text.len());
        if s.len() <= room {
            inner.text.push_str(s);
            return;
        }
        let mut end = room;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        inner.text.push_str(&s[..end]);
        inner.text.push_str(TRUNCATION_MARKER);
        inner.truncated = true;
    }

    /// Append a line (a trailing newline is added).
    pub fn push_line(&self, s: &str) {
        let mut line = String::with_capacity(s.len() + 1);
        line.push_str(s);
        line.push('\n');
        self.push(&line);
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> String {
        self.lock().text.clone()
    }

    /// Whether output has been dropped.
    pub fn is_truncated(&self) -> bool {
        self.lock().truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_limit() {
        let buf = OutputBuffer::new(64);
        buf.push("hello ");
        buf.push_line("world");
        assert_eq!(buf.contents(), "hello world\n");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn test_truncates_once() {
        let buf = OutputBuffer::new(4);
        buf.push("abcdef");
        buf.push("more");
        assert_eq!(buf.contents(), format!("abcd{TRUNCATION_MARKER}"));
        assert!(buf.is_truncated());
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        let buf = OutputBuffer::new(2);
        buf.push("é!");
        assert!(buf.contents().starts_with('é'));
    }

    #[test]
    fn test_clones_share_storage() {
        let buf = OutputBuffer::new(16);
        let other = buf.clone();
        other.push("x");
        assert_eq!(buf.contents(), "x");
    }
}
