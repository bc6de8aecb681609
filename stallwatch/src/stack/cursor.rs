//! Frame-by-frame stack walking
//!
//! A [`StackCursor`] walks one call stack and resolves each frame lazily.
//! Two sources exist: a live suspended thread
//! ([`super::live::LiveThreadCursor`]) and a previously captured address
//! array ([`ArrayCursor`]).
//!
//! ```text
//!   advance() ──▶ frame() ──▶ resolve_symbol()      (optional, lazy)
//!      │
//!      └─ false: bottom reached, chain broken, or depth ceiling hit
//!                (the latter two set has_given_up())
//! ```

use crate::domain::WalkAbort;
use crate::symbolization::{LoaderSymbolizer, SymbolResolver};

use super::captured::{clamp_depth, StackFrame};

/// Walks one call stack, innermost frame first.
pub trait StackCursor {
    /// Move to the next frame.
    ///
    /// Returns false at the stack bottom, on a broken chain, or once the depth
    /// ceiling is exceeded. Only the last two set [`has_given_up`].
    ///
    /// [`has_given_up`]: StackCursor::has_given_up
    fn advance(&mut self) -> bool;

    /// Current frame, `None` before the first `advance()` or after the end
    fn frame(&self) -> Option<&StackFrame>;

    fn frame_mut(&mut self) -> Option<&mut StackFrame>;

    /// Number of frames produced so far; the current frame has index `depth() - 1`
    fn depth(&self) -> usize;

    /// Whether the first frame holds the interrupted program counter
    fn leading_pc(&self) -> bool;

    /// Why the walk ended early, if it did
    fn abort_reason(&self) -> Option<WalkAbort>;

    /// Restart the walk from the innermost frame
    fn reset(&mut self);

    fn has_given_up(&self) -> bool {
        self.abort_reason().is_some()
    }

    /// Resolve the current frame through `resolver`.
    ///
    /// Returns false when the address lies outside every loaded image or its
    /// image has no symbol covering it. The frame then stays a raw address;
    /// image fields are still filled when the image is known.
    fn resolve_symbol_with(&mut self, resolver: &dyn SymbolResolver) -> bool {
        let is_pc = self.depth() == 1 && self.leading_pc();
        let Some(frame) = self.frame_mut() else {
            return false;
        };
        if frame.is_async_boundary() || frame.address == 0 {
            return false;
        }
        let Some(symbol) = resolver.resolve(lookup_address(frame.address, is_pc)) else {
            return false;
        };
        frame.image_base = Some(symbol.image_base);
        frame.image_name = symbol.image_name;
        frame.symbol_base = symbol.symbol_base;
        frame.symbol_name = symbol.symbol_name;
        frame.symbol_name.is_some()
    }

    /// Resolve the current frame against the dynamic loader's symbol tables
    fn resolve_symbol(&mut self) -> bool {
        self.resolve_symbol_with(LoaderSymbolizer::global())
    }

    /// Iterate the remaining frames, unresolved
    fn frames(&mut self) -> Frames<'_, Self>
    where
        Self: Sized,
    {
        Frames { cursor: self, resolver: None, reported_abort: false }
    }

    /// Iterate the remaining frames, resolving each through `resolver`
    fn symbolized_frames<'a>(&'a mut self, resolver: &'a dyn SymbolResolver) -> Frames<'a, Self>
    where
        Self: Sized,
    {
        Frames { cursor: self, resolver: Some(resolver), reported_abort: false }
    }
}

/// Strip architecture tag bits from an instruction address
#[cfg(target_arch = "arm")]
#[inline]
#[must_use]
pub fn detag(address: usize) -> usize {
    // Thumb bit
    address & !1
}

/// Strip architecture tag bits from an instruction address
#[cfg(target_arch = "aarch64")]
#[inline]
#[must_use]
pub fn detag(address: usize) -> usize {
    // Pointer authentication lives above the 48-bit virtual address space
    const VA_MASK: usize = 0x0000_ffff_ffff_ffff;
    (address & VA_MASK) & !3
}

/// Strip architecture tag bits from an instruction address
#[cfg(not(any(target_arch = "arm", target_arch = "aarch64")))]
#[inline]
#[must_use]
pub fn detag(address: usize) -> usize {
    address
}

/// Address to hand to symbol lookup for a frame.
///
/// Every frame but the live program counter holds a return address. The call
/// may be the last instruction of its function, so the return address can
/// belong to the next symbol; looking up one byte earlier lands inside the call.
#[inline]
#[must_use]
pub fn lookup_address(address: usize, is_program_counter: bool) -> usize {
    if is_program_counter {
        detag(address)
    } else {
        detag(address).saturating_sub(1)
    }
}

/// Iterator over a cursor's frames.
///
/// An aborted walk yields its frames and then exactly one `Err`.
pub struct Frames<'a, C: StackCursor> {
    cursor: &'a mut C,
    resolver: Option<&'a dyn SymbolResolver>,
    reported_abort: bool,
}

impl<C: StackCursor> Iterator for Frames<'_, C> {
    type Item = Result<StackFrame, WalkAbort>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.advance() {
            if let Some(resolver) = self.resolver {
                self.cursor.resolve_symbol_with(resolver);
            }
            return self.cursor.frame().cloned().map(Ok);
        }
        if self.reported_abort {
            return None;
        }
        self.reported_abort = true;
        self.cursor.abort_reason().map(Err)
    }
}

/// Cursor over an already captured address array
pub struct ArrayCursor<'a> {
    addresses: &'a [usize],
    max_depth: usize,
    leading_pc: bool,
    inherited_abort: Option<WalkAbort>,
    position: usize,
    current: Option<StackFrame>,
    abort: Option<WalkAbort>,
}

impl<'a> ArrayCursor<'a> {
    #[must_use]
    pub fn new(addresses: &'a [usize], max_depth: usize, leading_pc: bool) -> Self {
        Self {
            addresses,
            max_depth: clamp_depth(max_depth),
            leading_pc,
            inherited_abort: None,
            position: 0,
            current: None,
            abort: None,
        }
    }

    /// Report `abort` once the array is exhausted, for arrays that were
    /// themselves cut short when captured.
    #[must_use]
    pub fn with_inherited_abort(mut self, abort: Option<WalkAbort>) -> Self {
        self.inherited_abort = abort;
        self
    }
}

impl StackCursor for ArrayCursor<'_> {
    fn advance(&mut self) -> bool {
        if self.abort.is_some() {
            return false;
        }
        let Some(&address) = self.addresses.get(self.position) else {
            self.current = None;
            self.abort = self.inherited_abort;
            return false;
        };
        if self.position >= self.max_depth {
            self.current = None;
            self.abort = Some(WalkAbort::DepthCeiling(self.max_depth));
            return false;
        }
        self.position += 1;
        match self.current.as_mut() {
            Some(frame) => frame.reset_to(address),
            None => self.current = Some(StackFrame::new(address)),
        }
        true
    }

    fn frame(&self) -> Option<&StackFrame> {
        self.current.as_ref()
    }

    fn frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.current.as_mut()
    }

    fn depth(&self) -> usize {
        self.position
    }

    fn leading_pc(&self) -> bool {
        self.leading_pc
    }

    fn abort_reason(&self) -> Option<WalkAbort> {
        self.abort
    }

    fn reset(&mut self) {
        self.position = 0;
        self.current = None;
        self.abort = None;
    }
}

/// Resolve every address of `addresses` (innermost first) into frames.
///
/// Sentinel boundaries come back unresolved.
#[must_use]
pub fn symbolize_all(
    addresses: &[usize],
    leading_pc: bool,
    resolver: &dyn SymbolResolver,
) -> Vec<StackFrame> {
    let mut cursor = ArrayCursor::new(addresses, addresses.len().max(1), leading_pc);
    cursor.symbolized_frames(resolver).filter_map(Result::ok).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ASYNC_BOUNDARY;
    use crate::symbolization::Symbol;
    use std::cell::RefCell;

    /// Resolver that records every lookup address it was asked for
    struct RecordingResolver {
        lookups: RefCell<Vec<usize>>,
    }

    impl SymbolResolver for RecordingResolver {
        fn resolve(&self, address: usize) -> Option<Symbol> {
            self.lookups.borrow_mut().push(address);
            if address < 0x1000 {
                return None;
            }
            Some(Symbol {
                image_base: 0x1000,
                image_name: Some("libtest.so".to_string()),
                symbol_base: Some(address & !0xff),
                symbol_name: Some(format!("fn_{:x}", address & !0xff)),
            })
        }
    }

    #[test]
    fn test_array_cursor_walks_all_frames() {
        let addrs = [0x3000, 0x2000, 0x1000];
        let mut cursor = ArrayCursor::new(&addrs, 100, true);
        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.frame().unwrap().address);
        }
        assert_eq!(seen, addrs);
        assert!(!cursor.has_given_up());
        assert!(cursor.frame().is_none());
    }

    #[test]
    fn test_array_cursor_depth_ceiling() {
        let addrs = [1, 2, 3, 4, 5];
        let mut cursor = ArrayCursor::new(&addrs, 3, false);
        let results: Vec<_> = cursor.frames().collect();
        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(Result::is_ok));
        assert_eq!(results[3], Err(WalkAbort::DepthCeiling(3)));
        assert!(cursor.has_given_up());
    }

    #[test]
    fn test_frames_reports_abort_once() {
        let addrs = [1, 2];
        let mut cursor = ArrayCursor::new(&addrs, 100, false)
            .with_inherited_abort(Some(WalkAbort::BrokenChain { depth: 2, frame_pointer: 0x8 }));
        let mut frames = cursor.frames();
        assert!(frames.next().unwrap().is_ok());
        assert!(frames.next().unwrap().is_ok());
        assert!(matches!(frames.next(), Some(Err(WalkAbort::BrokenChain { .. }))));
        assert!(frames.next().is_none());
    }

    #[test]
    fn test_reset_restarts_walk() {
        let addrs = [9, 8];
        let mut cursor = ArrayCursor::new(&addrs, 1, false);
        assert!(cursor.advance());
        assert!(!cursor.advance());
        assert!(cursor.has_given_up());
        cursor.reset();
        assert!(!cursor.has_given_up());
        assert!(cursor.advance());
        assert_eq!(cursor.frame().unwrap().address, 9);
    }

    #[test]
    fn test_return_addresses_looked_up_one_byte_early() {
        let resolver = RecordingResolver { lookups: RefCell::new(Vec::new()) };
        let addrs = [0x2100, 0x2200, 0x2300];
        let mut cursor = ArrayCursor::new(&addrs, 100, true);
        while cursor.advance() {
            assert!(cursor.resolve_symbol_with(&resolver));
        }
        assert_eq!(
            *resolver.lookups.borrow(),
            vec![detag(0x2100), detag(0x2200) - 1, detag(0x2300) - 1]
        );
    }

    #[test]
    fn test_first_frame_adjusted_without_leading_pc() {
        let resolver = RecordingResolver { lookups: RefCell::new(Vec::new()) };
        let addrs = [0x2100];
        let mut cursor = ArrayCursor::new(&addrs, 100, false);
        assert!(cursor.advance());
        cursor.resolve_symbol_with(&resolver);
        assert_eq!(*resolver.lookups.borrow(), vec![detag(0x2100) - 1]);
    }

    #[test]
    fn test_unresolvable_frame_stays_raw() {
        let resolver = RecordingResolver { lookups: RefCell::new(Vec::new()) };
        let addrs = [0x10, ASYNC_BOUNDARY];
        let mut cursor = ArrayCursor::new(&addrs, 100, true);
        assert!(cursor.advance());
        assert!(!cursor.resolve_symbol_with(&resolver));
        assert!(cursor.frame().unwrap().symbol_name.is_none());

        assert!(cursor.advance());
        assert!(!cursor.resolve_symbol_with(&resolver));
        // Boundary is never handed to the resolver
        assert_eq!(resolver.lookups.borrow().len(), 1);
    }

    #[test]
    fn test_resolve_before_advance() {
        let addrs = [0x2100];
        let mut cursor = ArrayCursor::new(&addrs, 100, true);
        let resolver = RecordingResolver { lookups: RefCell::new(Vec::new()) };
        assert!(!cursor.resolve_symbol_with(&resolver));
    }

    #[test]
    fn test_symbolize_all() {
        let resolver = RecordingResolver { lookups: RefCell::new(Vec::new()) };
        let frames = symbolize_all(&[0x2150, ASYNC_BOUNDARY, 0x3301], true, &resolver);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].symbol_name.as_deref(), Some("fn_2100"));
        assert!(frames[1].is_async_boundary());
        assert_eq!(frames[2].symbol_name.as_deref(), Some("fn_3300"));
    }

    #[cfg(not(any(target_arch = "arm", target_arch = "aarch64")))]
    #[test]
    fn test_lookup_address() {
        assert_eq!(lookup_address(0x1000, true), 0x1000);
        assert_eq!(lookup_address(0x1000, false), 0x0fff);
        assert_eq!(lookup_address(0, false), 0);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_detag_strips_pac_and_alignment() {
        assert_eq!(detag(0x0012_0000_0040_1003), 0x0000_0000_0040_1000);
        assert_eq!(lookup_address(0x0040_1004, false), 0x0040_1003);
    }
}
