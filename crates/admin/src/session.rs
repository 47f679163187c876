// SPDX-License-Identifier: Apache-2.0

//! Per-invocation output accumulation.

/// Upper bound on the output a single command invocation can accumulate.
const MAX_BUF_SIZE: usize = 1024 * 1024;

/// Line-oriented output sink handed to command handlers.
///
/// Every call to [`Printer::line`] appends one newline-terminated row to the
/// session buffer. Output past the 1 MiB session cap is silently dropped,
/// so a runaway handler cannot grow the buffer without bound.
pub struct Printer {
    buf: String,
}

impl Printer {
    pub(crate) fn new() -> Self {
        Printer { buf: String::new() }
    }

    /// Append one output line.
    pub fn line(&mut self, text: &str) {
        if self.buf.len() >= MAX_BUF_SIZE {
            return;
        }

        let room = MAX_BUF_SIZE - self.buf.len();
        if text.len() + 1 > room {
            // Keep the newline so truncated output still ends on a boundary.
            let mut cut = room.saturating_sub(1);
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buf.push_str(&text[..cut]);
        } else {
            self.buf.push_str(text);
        }
        self.buf.push('\n');
    }

    pub(crate) fn into_output(self) -> String {
        self.buf
    }
}
