//! Control messages exchanged outside the sample-accurate event path.
//!
//! A control message is an object atom of type `message` carrying exactly
//! one property: `code` (script source), `error` (error text) or `trace`
//! (one trace line). The worker consumes `code` messages; the audio side
//! emits pending code echoes, errors and trace lines once per block.
//!
//! Texts produced on the audio thread go through [`FixedText`], a bounded
//! inline buffer that truncates instead of allocating.

use std::fmt;

use crate::atom::Key;
use crate::forge::{Forge, ForgeError};
use crate::view::View;

/// Bytes kept for the last error message.
pub const ERROR_CAPACITY: usize = 1024;
/// Bytes kept for trace lines between two `control_out` calls.
pub const TRACE_CAPACITY: usize = 4096;

/// One decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage<'a> {
    /// Script source to load.
    Code(&'a str),
    /// Compile or runtime error text.
    Error(&'a str),
    /// One trace line.
    Trace(&'a str),
}

impl<'a> ControlMessage<'a> {
    /// Decode a message object. Anything else yields `None`.
    pub fn from_view(view: View<'a>) -> Option<Self> {
        let urids = *view.reader().urids();
        if !urids.is_object(view.type_id()) || view.object_type() != Some(urids.message) {
            return None;
        }
        view.iter().find_map(|(key, value)| {
            let key = match key {
                Key::Property { key, .. } => key,
                _ => return None,
            };
            let text = value.as_str()?;
            if key == urids.code {
                Some(ControlMessage::Code(text))
            } else if key == urids.error {
                Some(ControlMessage::Error(text))
            } else if key == urids.trace {
                Some(ControlMessage::Trace(text))
            } else {
                None
            }
        })
    }

    /// Text payload.
    pub fn text(&self) -> &'a str {
        match *self {
            ControlMessage::Code(t) | ControlMessage::Error(t) | ControlMessage::Trace(t) => t,
        }
    }

    /// Write the message as one object atom.
    pub fn forge(&self, forge: &mut Forge<'_>) -> Result<(), ForgeError> {
        let urids = *forge.urids();
        let key = match self {
            ControlMessage::Code(_) => urids.code,
            ControlMessage::Error(_) => urids.error,
            ControlMessage::Trace(_) => urids.trace,
        };
        let frame = forge.object(0, urids.message)?;
        forge.key(key, 0)?;
        forge.string(self.text())?;
        forge.close(frame)
    }
}

/// Bounded, non-allocating UTF-8 text buffer.
///
/// Writes past capacity are cut at a character boundary and flagged.
#[derive(Clone)]
pub struct FixedText<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> FixedText<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn as_str(&self) -> &str {
        // Only whole characters are ever copied in.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Some input was cut off since the last clear.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }

    /// Append as much of `s` as fits.
    pub fn push_str(&mut self, s: &str) {
        let room = N - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        if take < s.len() {
            self.truncated = true;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
    }

    /// Append `line` followed by a newline.
    pub fn push_line(&mut self, line: &str) {
        self.push_str(line);
        self.push_str("\n");
    }

    /// Non-empty lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.as_str().lines().filter(|l| !l.is_empty())
    }
}

impl<const N: usize> Default for FixedText<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedText<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for FixedText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedText")
            .field("text", &self.as_str())
            .field("truncated", &self.truncated)
            .finish()
    }
}

/// Error text carried from the interpreter to `control_out`.
pub type ErrorText = FixedText<ERROR_CAPACITY>;
/// Trace lines carried from the interpreter to `control_out`.
pub type TraceText = FixedText<TRACE_CAPACITY>;

/// Diagnostic state owned by the interpreter.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub error: ErrorText,
    pub trace: TraceText,
    /// Error text is waiting for `control_out`.
    pub error_pending: bool,
    /// Code echo is waiting for `control_out`.
    pub code_pending: bool,
    /// The script is bypassed until new code loads.
    pub sticky: bool,
}

impl Diagnostics {
    /// Record an error; `sticky` errors bypass the script from now on.
    pub fn report(&mut self, err: &dyn fmt::Display, sticky: bool) {
        use fmt::Write;
        self.error.clear();
        let _ = write!(self.error, "{err}");
        self.error_pending = true;
        self.sticky |= sticky;
    }

    /// Everything pending went out through `control_out`.
    pub fn sent(&mut self) {
        self.code_pending = false;
        self.error_pending = false;
        self.trace.clear();
    }

    /// A new script was installed.
    pub fn loaded(&mut self) {
        self.error.clear();
        self.error_pending = false;
        self.sticky = false;
        self.code_pending = true;
    }
}
