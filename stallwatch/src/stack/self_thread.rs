//! Stack capture of the calling thread
//!
//! No suspension is involved, so this is what the asynchronous-origin tracker
//! uses on every submission.

use super::captured::{clamp_depth, CapturedStack};

/// Unwinder frames expected above ours before giving up on finding the anchor
const UNWINDER_FRAMES: usize = 16;

/// Frames dropped when the unwinder reports no symbol addresses:
/// `backtrace::trace` and this function
const UNANCHORED_SKIP: usize = 2;

/// Capture the calling thread's stack, innermost first.
///
/// The first stored frame is the caller of this function; `skip` drops that
/// many more. Our own frame is found by its symbol address, so whatever the
/// unwinder puts above it never leaks into the result. Every stored address is
/// a return address. A stack deeper than `max_depth` is truncated and marked
/// as given up.
#[inline(never)]
#[must_use]
pub fn capture_current_thread(skip: usize, max_depth: usize) -> CapturedStack {
    let max_depth = clamp_depth(max_depth);
    let anchor = capture_current_thread as *const () as usize;
    // One past the ceiling so truncation can be detected
    let limit = max_depth + 1;
    let mut raw = Vec::with_capacity(UNWINDER_FRAMES + limit);
    let mut anchor_index = None;

    backtrace::trace(|frame| {
        let ip = frame.ip() as usize;
        if ip == 0 {
            return false;
        }
        if anchor_index.is_none() && frame.symbol_address() as usize == anchor {
            anchor_index = Some(raw.len());
        }
        raw.push(ip);
        let wanted = anchor_index.map_or(UNWINDER_FRAMES, |i| i + 1);
        raw.len() < wanted.saturating_add(skip).saturating_add(limit)
    });

    let start = anchor_index.map_or(UNANCHORED_SKIP, |i| i + 1).saturating_add(skip);
    let addresses = raw.get(start..).map(<[usize]>::to_vec).unwrap_or_default();
    CapturedStack::from_addresses(addresses, max_depth, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn nested(levels: usize, max_depth: usize) -> CapturedStack {
        if levels == 0 {
            capture_current_thread(0, max_depth)
        } else {
            let stack = nested(levels - 1, max_depth);
            std::hint::black_box(&stack);
            stack
        }
    }

    #[test]
    fn test_captures_frames() {
        let stack = capture_current_thread(0, 64);
        assert!(!stack.is_empty());
        assert!(!stack.leading_pc());
        assert!(stack.depth() <= 64);
    }

    #[test]
    fn test_depth_ceiling_marks_given_up() {
        let stack = nested(20, 4);
        assert_eq!(stack.depth(), 4);
        assert!(stack.has_given_up());
    }

    #[test]
    fn test_skip_drops_callers() {
        let full = capture_current_thread(0, 256);
        let skipped = capture_current_thread(1, 256);
        assert!(!full.has_given_up());
        assert_eq!(skipped.depth() + 1, full.depth());
        assert_eq!(&full.addresses()[1..], skipped.addresses());
    }

    #[test]
    fn test_skip_beyond_stack_is_empty() {
        let stack = capture_current_thread(100_000, 100);
        assert!(stack.is_empty());
        assert!(!stack.has_given_up());
    }
}
