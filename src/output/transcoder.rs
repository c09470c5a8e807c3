//! Rebuilds a readable log from a child's raw output stream.
//!
//! Progress bars redraw their line with a bare `\r` and erase characters
//! with `\b`. The transcoder emulates what a terminal would show: a chunk
//! following a trailing bare `\r` replaces the log's last line instead of
//! being appended after it.

/// What a single [`StreamTranscoder::feed`] call did to the log.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transcribed {
    pub log_changed: bool,
    /// The new one-line status, when the chunk carried visible text.
    pub status: Option<String>,
}

/// Per-run transcoding state.
#[derive(Debug, Default, Clone)]
pub struct StreamTranscoder {
    pending: String,
    expect_overwrite: bool,
}

impl StreamTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expects_overwrite(&self) -> bool {
        self.expect_overwrite
    }

    /// Feeds one chunk into `log`.
    pub fn feed(&mut self, log: &mut String, chunk: &str) -> Transcribed {
        let terminated = chunk.ends_with('\r') || chunk.ends_with('\n');
        if !terminated && self.expect_overwrite {
            // Not yet known whether this redraws the line; wait for a terminator.
            self.pending.push_str(chunk);
            return Transcribed::default();
        }

        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);

        if self.expect_overwrite && text == "\n" {
            self.expect_overwrite = false;
        }

        let before = log.len();
        let text = resolve_backspaces(log, &text);
        let mut log_changed = log.len() != before;

        if self.expect_overwrite && !strip_line_breaks(&text).trim().is_empty() {
            let keep = log.rfind('\n').map_or(0, |idx| idx + 1);
            log.truncate(keep);
            log_changed = true;
        }
        if !text.is_empty() {
            log.push_str(&text);
            log_changed = true;
        }

        let status = {
            let visible = strip_line_breaks(&text);
            (!visible.trim().is_empty()).then_some(visible)
        };

        let mut parts = text.split('\r');
        self.expect_overwrite = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(_), Some(""), None)
        );

        Transcribed {
            log_changed,
            status,
        }
    }
}

const BACKSPACE: char = '\u{8}';

/// Applies every `\b` in `text`. Characters of `text` itself are erased
/// first; a backspace with nothing before it in `text` erases from `log`.
/// Erasure never crosses a newline.
fn resolve_backspaces(log: &mut String, text: &str) -> String {
    if !text.contains(BACKSPACE) {
        return text.to_string();
    }

    let mut resolved = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch != BACKSPACE {
            resolved.push(ch);
            continue;
        }
        if !resolved.is_empty() {
            if !resolved.ends_with('\n') {
                resolved.pop();
            }
        } else if !log.is_empty() && !log.ends_with('\n') {
            log.pop();
        }
    }
    resolved
}

fn strip_line_breaks(text: &str) -> String {
    text.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> (String, Option<String>) {
        let mut transcoder = StreamTranscoder::new();
        let mut log = String::new();
        let mut status = None;
        for chunk in chunks {
            if let Some(s) = transcoder.feed(&mut log, chunk).status {
                status = Some(s);
            }
        }
        (log, status)
    }

    #[test]
    fn plain_chunks_concatenate() {
        let chunks = ["hello ", "wor", "ld\n", "second line\n", "tail"];
        let (log, status) = run(&chunks);
        assert_eq!(log, chunks.concat());
        assert_eq!(status.as_deref(), Some("tail"));
    }

    #[test]
    fn carriage_return_redraws_last_line() {
        let (log, status) = run(&["Starting\n", "50%\r", "\rDone\r\n"]);
        assert_eq!(log, "Starting\n\rDone\r\n");
        assert_eq!(log.matches("Done").count(), 1);
        assert!(!log.contains("50%"));
        assert_eq!(status.as_deref(), Some("Done"));
    }

    #[test]
    fn progress_sequence_keeps_only_latest_line() {
        let (log, _) = run(&["10%\r", "20%\r", "30%\r", "\n"]);
        assert_eq!(log, "30%\r\n");
    }

    #[test]
    fn backspaces_erase_within_chunk() {
        let (log, _) = run(&["abc\u{8}\u{8}X"]);
        assert_eq!(log, "aX");
    }

    #[test]
    fn leading_backspace_erases_from_log() {
        let (log, _) = run(&["abc", "\u{8}d"]);
        assert_eq!(log, "abd");
    }

    #[test]
    fn backspace_never_crosses_newline() {
        let (log, _) = run(&["line\n", "\u{8}\u{8}next"]);
        assert_eq!(log, "line\nnext");

        let (log, _) = run(&["a\n\u{8}b"]);
        assert_eq!(log, "a\nb");
    }

    #[test]
    fn backspace_on_empty_log_is_ignored() {
        let (log, _) = run(&["\u{8}\u{8}ok"]);
        assert_eq!(log, "ok");
    }

    #[test]
    fn unterminated_fragment_after_redraw_is_held_back() {
        let mut transcoder = StreamTranscoder::new();
        let mut log = String::new();
        transcoder.feed(&mut log, "1/3\r");
        assert!(transcoder.expects_overwrite());

        let partial = transcoder.feed(&mut log, "2/");
        assert_eq!(partial, Transcribed::default());
        assert_eq!(log, "1/3\r");

        let done = transcoder.feed(&mut log, "3\r");
        assert!(done.log_changed);
        assert_eq!(done.status.as_deref(), Some("2/3"));
        assert_eq!(log, "2/3\r");
    }

    #[test]
    fn bare_newline_after_redraw_does_not_truncate() {
        let (log, status) = run(&["working\r", "\n", "next\n"]);
        assert_eq!(log, "working\r\nnext\n");
        assert_eq!(status.as_deref(), Some("next"));
    }

    #[test]
    fn blank_chunks_leave_status_alone() {
        let mut transcoder = StreamTranscoder::new();
        let mut log = String::new();
        assert_eq!(
            transcoder.feed(&mut log, "ready\n").status.as_deref(),
            Some("ready")
        );
        assert_eq!(transcoder.feed(&mut log, "  \n\n").status, None);
        assert_eq!(log, "ready\n  \n\n");
    }

    #[test]
    fn double_carriage_return_does_not_arm_overwrite() {
        let mut transcoder = StreamTranscoder::new();
        let mut log = String::new();
        transcoder.feed(&mut log, "a\rb\r");
        assert!(!transcoder.expects_overwrite());
        transcoder.feed(&mut log, "c\n");
        assert_eq!(log, "a\rb\rc\n");
    }
}
