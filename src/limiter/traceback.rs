//! Serializable stand-in for a child-side stack trace

use std::backtrace::Backtrace;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

/// Frames beyond this many are dropped
const MAX_FRAMES: usize = 64;

/// A stack trace captured in the child and rendered for logs in the parent
///
/// Frames are plain strings; the surrogate can be displayed but not resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracebackSurrogate {
    pub message: String,
    pub frames: Vec<String>,
}

impl TracebackSurrogate {
    pub fn new(message: impl Into<String>, frames: Vec<String>) -> Self {
        Self {
            message: message.into(),
            frames,
        }
    }

    /// Capture the current thread's stack
    pub fn capture(message: impl Into<String>) -> Self {
        Self::from_backtrace(message, &Backtrace::force_capture())
    }

    pub fn from_backtrace(message: impl Into<String>, backtrace: &Backtrace) -> Self {
        Self::new(message, parse_frames(&backtrace.to_string()))
    }

    /// Multi-line rendering, innermost frame first
    pub fn render(&self) -> String {
        let mut out = format!("Traceback: {}", self.message);
        for frame in &self.frames {
            out.push_str("\n  ");
            out.push_str(frame);
        }
        out
    }

    /// A surrogate cannot be turned back into a live unwind
    pub fn reraise(&self) -> Result<()> {
        Err(RunnerError::TracebackNotResumable)
    }
}

impl fmt::Display for TracebackSurrogate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// One entry per frame, joining the `at file:line` continuation lines
fn parse_frames(text: &str) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match (line.strip_prefix("at "), frames.last_mut()) {
            (Some(location), Some(last)) => {
                last.push_str(" @ ");
                last.push_str(location);
            }
            _ => {
                if frames.len() >= MAX_FRAMES {
                    break;
                }
                frames.push(line.to_string());
            }
        }
    }
    frames
}
