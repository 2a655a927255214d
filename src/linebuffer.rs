//! Line assembly for the raw byte stream delivered by a connection.
//!
//! Chunks arrive at arbitrary boundaries; the buffer splits them into
//! complete lines according to the session's line-terminator convention and
//! exposes the undelivered tail as a partial line, so prompt patterns (which
//! are almost never newline-terminated) can still be matched.

/// Line-terminator convention of the remote side, selectable per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    /// `\n`, tolerating a preceding `\r` (the common Unix/network mix).
    #[default]
    Lf,
    /// Strict `\r\n`.
    CrLf,
    /// Bare `\r` (some serial consoles).
    Cr,
}

impl LineEnding {
    /// The byte sequence appended by `send_line`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::Cr => "\r",
        }
    }
}

/// A line (or partial line) produced by [`LineBuffer::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedLine {
    pub text: String,
    /// `true` when the line was terminator-delimited; `false` for the
    /// still-growing tail, which is re-delivered as more data arrives.
    pub is_full: bool,
}

/// Accumulates undelivered bytes between feeds for one observer.
///
/// ANSI escape sequences are stripped before buffering, including sequences
/// split across chunk boundaries.
#[derive(Debug)]
pub struct LineBuffer {
    pending: String,
    ending: LineEnding,
    esc: EscState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscState {
    Plain,
    Escape,
    Csi,
}

impl LineBuffer {
    pub fn new(ending: LineEnding) -> Self {
        Self {
            pending: String::new(),
            ending,
            esc: EscState::Plain,
        }
    }

    /// Append a chunk and return the complete lines it finished, followed by
    /// at most one partial view of the remaining tail.
    ///
    /// The tail stays buffered: once its terminator arrives, the same content
    /// is delivered again as a full line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<BufferedLine> {
        let text = String::from_utf8_lossy(chunk);
        for ch in text.chars() {
            self.push_filtered(ch);
        }

        let mut lines = Vec::new();
        while let Some(line) = self.take_full_line() {
            lines.push(BufferedLine {
                text: line,
                is_full: true,
            });
        }
        if !self.pending.is_empty() {
            lines.push(BufferedLine {
                text: self.pending.clone(),
                is_full: false,
            });
        }
        lines
    }

    fn take_full_line(&mut self) -> Option<String> {
        let (idx, skip) = match self.ending {
            LineEnding::Lf => (self.pending.find('\n')?, 1),
            LineEnding::CrLf => (self.pending.find("\r\n")?, 2),
            LineEnding::Cr => (self.pending.find('\r')?, 1),
        };
        let rest = self.pending.split_off(idx + skip);
        let mut line = std::mem::replace(&mut self.pending, rest);
        line.truncate(line.len() - skip);
        if self.ending == LineEnding::Lf && line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    // Tiny ANSI filter: drops ESC [...X CSI sequences and two-byte escapes.
    fn push_filtered(&mut self, ch: char) {
        match self.esc {
            EscState::Plain => {
                if ch == '\x1b' {
                    self.esc = EscState::Escape;
                } else if ch != '\x07' {
                    self.pending.push(ch);
                }
            }
            EscState::Escape => {
                self.esc = if ch == '[' {
                    EscState::Csi
                } else {
                    EscState::Plain
                };
            }
            EscState::Csi => {
                if ('\x40'..='\x7e').contains(&ch) {
                    self.esc = EscState::Plain;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(s: &str) -> BufferedLine {
        BufferedLine {
            text: s.into(),
            is_full: true,
        }
    }

    fn partial(s: &str) -> BufferedLine {
        BufferedLine {
            text: s.into(),
            is_full: false,
        }
    }

    #[test]
    fn test_two_lines_one_chunk() {
        let mut buf = LineBuffer::new(LineEnding::Lf);
        assert_eq!(
            buf.feed(b"hello\nworld\n"),
            vec![full("hello"), full("world")]
        );
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut buf = LineBuffer::new(LineEnding::Lf);
        assert_eq!(buf.feed(b"hel"), vec![partial("hel")]);
        assert_eq!(buf.feed(b"lo\nwo"), vec![full("hello"), partial("wo")]);
        assert_eq!(buf.feed(b"rld\n"), vec![full("world")]);
    }

    #[test]
    fn test_lf_tolerates_crlf() {
        let mut buf = LineBuffer::new(LineEnding::Lf);
        assert_eq!(buf.feed(b"uptime\r\n"), vec![full("uptime")]);
    }

    #[test]
    fn test_strict_crlf() {
        let mut buf = LineBuffer::new(LineEnding::CrLf);
        let out = buf.feed(b"a\nb\r\nc");
        assert_eq!(out, vec![full("a\nb"), partial("c")]);
    }

    #[test]
    fn test_bare_cr() {
        let mut buf = LineBuffer::new(LineEnding::Cr);
        assert_eq!(buf.feed(b"one\rtwo"), vec![full("one"), partial("two")]);
    }

    #[test]
    fn test_prompt_stays_partial() {
        let mut buf = LineBuffer::new(LineEnding::Lf);
        assert_eq!(buf.feed(b"user@host $ "), vec![partial("user@host $ ")]);
        // Re-delivered when more data arrives on the same line.
        assert_eq!(
            buf.feed(b"date\n"),
            vec![full("user@host $ date")]
        );
    }

    #[test]
    fn test_ansi_sequences_stripped() {
        let mut buf = LineBuffer::new(LineEnding::Lf);
        assert_eq!(
            buf.feed(b"\x1b[1;32mgreen\x1b[0m text\n"),
            vec![full("green text")]
        );
    }

    #[test]
    fn test_ansi_split_across_chunks() {
        let mut buf = LineBuffer::new(LineEnding::Lf);
        assert_eq!(buf.feed(b"ok\x1b[3"), vec![partial("ok")]);
        assert_eq!(buf.feed(b"1mred\n"), vec![full("okred")]);
    }
}
