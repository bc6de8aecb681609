//! Stack capture and walking
//!
//! - **`captured`**: the owned [`CapturedStack`] every other component consumes
//! - **`cursor`**: the [`StackCursor`] trait and [`ArrayCursor`]
//! - **`live`**: suspend-and-walk capture of another thread ([`capture_thread`])
//! - **`self_thread`**: capture of the calling thread ([`capture_current_thread`])

pub mod captured;
pub mod cursor;
pub mod live;
pub mod self_thread;

pub use captured::{clamp_depth, CapturedStack, StackFrame, ASYNC_BOUNDARY, MAX_STACK_DEPTH};
pub use cursor::{detag, lookup_address, symbolize_all, ArrayCursor, Frames, StackCursor};
pub use live::{capture_thread, FrameReader, LiveThreadCursor, ProcessMemory, Registers};
pub use self_thread::capture_current_thread;

/// Depth used when none is configured
pub const DEFAULT_STACK_DEPTH: usize = 100;
