//! Frame symbolization: converts a published frame chain into the
//! symbolic frame list carried by events.

use crate::runtime::FrameNode;
use serde::Serialize;
use std::sync::Arc;

/// One symbolic stack level as it appears on emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub function: &'static str,
    pub file: &'static str,
    pub line: u32,
}

/// Walk a frame chain, leaf first, into at most `max_nframes` symbolic
/// frames. The returned count is the total chain depth, which can exceed
/// the length of the truncated frame list.
pub fn framify(frame: &Arc<FrameNode>, max_nframes: usize) -> (Vec<Frame>, usize) {
    let mut frames = Vec::new();
    let mut depth = 0usize;
    let mut cursor = Some(frame);
    while let Some(node) = cursor {
        depth += 1;
        if frames.len() < max_nframes {
            frames.push(Frame {
                function: node.function,
                file: node.location.file(),
                line: node.location.line(),
            });
        }
        cursor = node.parent.as_ref();
    }
    (frames, depth)
}

/// Symbolize an error traceback. Tracebacks are frame chains captured at
/// the moment the error was recorded, so this is the same walk as
/// [`framify`].
pub fn traceback_framify(traceback: &Arc<FrameNode>, max_nframes: usize) -> (Vec<Frame>, usize) {
    framify(traceback, max_nframes)
}
