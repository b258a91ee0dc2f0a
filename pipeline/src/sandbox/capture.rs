//! Bounded text capture for sandbox stdout/stderr.

/// Keeps at most `limit` bytes and counts what was dropped.
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    text: String,
    limit: usize,
    truncated: usize,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: 0,
        }
    }

    pub fn push_str(&mut self, chunk: &str) {
        let room = self.limit.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }
        let mut cut = room;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.truncated += chunk.len() - cut;
    }

    pub fn push_line(&mut self, line: &str) {
        self.push_str(line);
        self.push_str("\n");
    }

    pub fn truncated(&self) -> usize {
        self.truncated
    }

    /// Captured text followed by a notice when anything was dropped.
    pub fn finish(self, label: &str) -> String {
        with_notice(self.text, self.truncated, label)
    }
}

/// Append the `[label truncated N bytes]` notice used for every capture.
pub fn with_notice(mut text: String, truncated: usize, label: &str) -> String {
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]\n"));
    }
    text
}
