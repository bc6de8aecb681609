//! Owned call-stack snapshots and resolved frames

use std::fmt;

use crate::domain::WalkAbort;

use super::cursor::ArrayCursor;

/// Hard ceiling on the number of frames any walk may produce.
///
/// Guarantees termination on a corrupted or cyclic frame-pointer chain.
pub const MAX_STACK_DEPTH: usize = 300;

/// Frame separating an executing stack from the issuer stack spliced after it.
///
/// Never a valid instruction address, and never resolved.
pub const ASYNC_BOUNDARY: usize = usize::MAX;

/// One snapshot of a call stack, innermost frame first.
///
/// Immutable once captured. The depth never exceeds the `max_depth` it was
/// captured with, which is itself clamped to [`MAX_STACK_DEPTH`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapturedStack {
    addresses: Vec<usize>,
    /// First address is the interrupted program counter rather than a return address
    leading_pc: bool,
    abort: Option<WalkAbort>,
}

impl CapturedStack {
    /// Build a stack from raw addresses, truncating to `max_depth`.
    ///
    /// Truncation marks the stack as given up with [`WalkAbort::DepthCeiling`].
    #[must_use]
    pub fn from_addresses(mut addresses: Vec<usize>, max_depth: usize, leading_pc: bool) -> Self {
        let max_depth = clamp_depth(max_depth);
        let mut abort = None;
        if addresses.len() > max_depth {
            addresses.truncate(max_depth);
            abort = Some(WalkAbort::DepthCeiling(max_depth));
        }
        Self { addresses, leading_pc, abort }
    }

    pub(crate) fn from_walk(
        addresses: Vec<usize>,
        leading_pc: bool,
        abort: Option<WalkAbort>,
    ) -> Self {
        debug_assert!(addresses.len() <= MAX_STACK_DEPTH);
        Self { addresses, leading_pc, abort }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn addresses(&self) -> &[usize] {
        &self.addresses
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.addresses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Innermost (most recently called) address
    #[must_use]
    pub fn innermost(&self) -> Option<usize> {
        self.addresses.first().copied()
    }

    /// Outermost address, the root of the chain in a call tree
    #[must_use]
    pub fn outermost(&self) -> Option<usize> {
        self.addresses.last().copied()
    }

    #[must_use]
    pub fn leading_pc(&self) -> bool {
        self.leading_pc
    }

    /// The walk that produced this stack was cut short
    #[must_use]
    pub fn has_given_up(&self) -> bool {
        self.abort.is_some()
    }

    #[must_use]
    pub fn abort_reason(&self) -> Option<WalkAbort> {
        self.abort
    }

    /// Whether an issuer stack has been spliced onto this one
    #[must_use]
    pub fn contains_async_boundary(&self) -> bool {
        self.addresses.contains(&ASYNC_BOUNDARY)
    }

    /// Frames of the executing thread only, up to the first async boundary
    #[must_use]
    pub fn executing_part(&self) -> &[usize] {
        let end =
            self.addresses.iter().position(|&a| a == ASYNC_BOUNDARY).unwrap_or(self.addresses.len());
        &self.addresses[..end]
    }

    /// Walk the stored addresses with a cursor bounded by the stack's own depth
    #[must_use]
    pub fn cursor(&self) -> ArrayCursor<'_> {
        ArrayCursor::new(&self.addresses, MAX_STACK_DEPTH, self.leading_pc)
            .with_inherited_abort(self.abort)
    }
}

impl fmt::Display for CapturedStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &addr) in self.addresses.iter().enumerate() {
            if addr == ASYNC_BOUNDARY {
                writeln!(f, "#{i:<3} ---- async boundary ----")?;
            } else {
                writeln!(f, "#{i:<3} 0x{addr:016x}")?;
            }
        }
        if let Some(abort) = self.abort {
            writeln!(f, "     ({abort})")?;
        }
        Ok(())
    }
}

/// Clamp a requested depth into `1..=MAX_STACK_DEPTH`
#[must_use]
pub fn clamp_depth(max_depth: usize) -> usize {
    max_depth.clamp(1, MAX_STACK_DEPTH)
}

/// One frame of a walked stack. Resolution fields stay `None` until
/// [`super::StackCursor::resolve_symbol`] succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackFrame {
    pub address: usize,
    pub image_base: Option<usize>,
    pub image_name: Option<String>,
    pub symbol_base: Option<usize>,
    pub symbol_name: Option<String>,
}

impl StackFrame {
    #[must_use]
    pub fn new(address: usize) -> Self {
        Self { address, ..Self::default() }
    }

    #[must_use]
    pub fn is_async_boundary(&self) -> bool {
        self.address == ASYNC_BOUNDARY
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.symbol_name.is_some()
    }

    /// Reuse the frame for a new address without touching its string buffers'
    /// allocation until resolution.
    pub(crate) fn reset_to(&mut self, address: usize) {
        self.address = address;
        self.image_base = None;
        self.image_name = None;
        self.symbol_base = None;
        self.symbol_name = None;
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_async_boundary() {
            return f.write_str("---- async boundary ----");
        }
        write!(f, "0x{:016x}", self.address)?;
        match (&self.symbol_name, self.symbol_base) {
            (Some(name), Some(base)) => write!(f, " {name} + {}", self.address.wrapping_sub(base))?,
            (Some(name), None) => write!(f, " {name}")?,
            _ => {}
        }
        if let Some(image) = &self.image_name {
            let short = image.rsplit('/').next().unwrap_or(image);
            write!(f, " ({short})")?;
        }
        Ok(())
    }
}
