//! Bounded collection of subprocess output.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Cap on collected output per stream.
const MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;
/// Number of recent lines kept for heartbeats.
const TAIL_LINES: usize = 20;
/// Age after which a partial line is flushed into the buffer anyway.
const PARTIAL_MAX_AGE: Duration = Duration::from_secs(2);

/// Collects one output stream with a hard size cap, a recent-lines ring
/// for heartbeat reporting, and timed flushing of partial lines so a
/// process that prints without newlines still shows progress.
#[derive(Debug)]
pub struct OutputCollector {
    buffer: String,
    truncated: bool,
    lines: u64,
    recent: VecDeque<String>,
    partial: String,
    partial_since: Option<Instant>,
}

impl OutputCollector {
    /// Creates an empty collector with the default cap.
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            truncated: false,
            lines: 0,
            recent: VecDeque::with_capacity(TAIL_LINES),
            partial: String::new(),
            partial_since: None,
        }
    }

    /// Appends a chunk of raw output.
    pub fn push_chunk(&mut self, chunk: &str) {
        self.append_capped(chunk);

        let mut rest = chunk;
        while let Some(newline) = rest.find('\n') {
            let (head, tail) = rest.split_at(newline);
            self.complete_line(head);
            rest = &tail[1..];
        }
        if rest.is_empty() {
            self.partial.clear();
            self.partial_since = None;
        } else {
            if self.partial.is_empty() {
                self.partial_since = Some(Instant::now());
            }
            self.partial.push_str(rest);
        }
    }

    fn complete_line(&mut self, tail_of_line: &str) {
        let mut line = std::mem::take(&mut self.partial);
        self.partial_since = None;
        line.push_str(tail_of_line);
        self.lines += 1;
        if self.recent.len() == TAIL_LINES {
            self.recent.pop_front();
        }
        self.recent.push_back(line);
    }

    fn append_capped(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let remaining = MAX_CAPTURE_BYTES.saturating_sub(self.buffer.len());
        if chunk.len() <= remaining {
            self.buffer.push_str(chunk);
        } else {
            let mut cut = remaining;
            while cut > 0 && !chunk.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buffer.push_str(&chunk[..cut]);
            self.truncated = true;
        }
    }

    /// Moves a stale partial line into the recent ring so heartbeats see
    /// output from processes that do not emit newlines.
    pub fn flush_stale(&mut self) {
        if let Some(since) = self.partial_since {
            if since.elapsed() >= PARTIAL_MAX_AGE {
                self.flush_partial();
            }
        }
    }

    /// Unconditionally flushes any partial line.
    pub fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.partial_since = None;
            self.lines += 1;
            if self.recent.len() == TAIL_LINES {
                self.recent.pop_front();
            }
            self.recent.push_back(line);
        }
    }

    /// Collected output (bounded).
    pub fn contents(&self) -> &str {
        &self.buffer
    }

    /// True when the cap was hit and output was dropped.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Number of completed lines seen.
    pub fn line_count(&self) -> u64 {
        self.lines
    }

    /// The recent-lines tail joined with newlines.
    pub fn tail(&self) -> String {
        self.recent
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for OutputCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_lines() {
        let mut col = OutputCollector::new();
        col.push_chunk("one\ntwo\nthr");
        col.push_chunk("ee\n");

        assert_eq!(col.line_count(), 3);
        assert_eq!(col.contents(), "one\ntwo\nthree\n");
        assert_eq!(col.tail(), "one\ntwo\nthree");
    }

    #[test]
    fn test_tail_keeps_last_twenty() {
        let mut col = OutputCollector::new();
        for i in 0..30 {
            col.push_chunk(&format!("line-{}\n", i));
        }
        let tail = col.tail();
        assert!(tail.starts_with("line-10"));
        assert!(tail.ends_with("line-29"));
        assert_eq!(tail.lines().count(), 20);
    }

    #[test]
    fn test_cap_truncates() {
        let mut col = OutputCollector::new();
        let big = "x".repeat(MAX_CAPTURE_BYTES + 100);
        col.push_chunk(&big);

        assert!(col.is_truncated());
        assert_eq!(col.contents().len(), MAX_CAPTURE_BYTES);

        // Further output is dropped but line accounting continues.
        col.push_chunk("more\n");
        assert_eq!(col.contents().len(), MAX_CAPTURE_BYTES);
        assert!(col.line_count() >= 1);
    }

    #[test]
    fn test_flush_partial() {
        let mut col = OutputCollector::new();
        col.push_chunk("no newline yet");
        assert_eq!(col.line_count(), 0);

        col.flush_partial();
        assert_eq!(col.line_count(), 1);
        assert_eq!(col.tail(), "no newline yet");
    }

    #[test]
    fn test_partial_continues_across_chunks() {
        let mut col = OutputCollector::new();
        col.push_chunk("beg");
        col.push_chunk("in\nrest");
        assert_eq!(col.line_count(), 1);
        assert_eq!(col.tail(), "begin");
        col.flush_partial();
        assert_eq!(col.tail(), "begin\nrest");
    }
}
