//! # Symbol Resolution
//!
//! Maps instruction addresses captured by the stack cursors to the image and
//! routine that contain them. Two resolvers exist:
//!
//! - **`loader`**: asks the dynamic loader (`dladdr`) for the nearest
//!   preceding exported symbol. Works for every loaded image with no debug
//!   info, cheap enough to run on the checker thread. This is the default.
//! - **`symbolizer`** + **`memory_maps`**: DWARF function/file/line resolution
//!   for the main executable via `addr2line`, with PIE adjustment from
//!   `/proc/self/maps`. Used when offline-quality names are wanted.
//!
//! ## Address Normalization
//!
//! Resolvers receive a *lookup address*: tag bits already stripped and, for
//! return addresses, already moved one byte back into the call instruction
//! (see [`crate::stack::lookup_address`]).
//!
//! ```text
//! return address   0x55f3a2b4c785 ──▶ lookup 0x55f3a2b4c784
//!                                         │
//!                  dladdr ────────────────┤  symbol base 0x55f3a2b4c700
//!                                         ▼
//!               cache [0x...c700, 0x...c784] ──▶ "app::worker::run"
//! ```
//!
//! A miss is never an error: the frame stays a raw address.

pub mod loader;
pub mod memory_maps;
pub mod symbolizer;

pub use loader::LoaderSymbolizer;
pub use memory_maps::{parse_memory_maps, MemoryRange};
pub use symbolizer::{DwarfResolver, Symbolizer};

/// What a resolver knows about one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub image_base: usize,
    pub image_name: Option<String>,
    pub symbol_base: Option<usize>,
    pub symbol_name: Option<String>,
}

/// Maps a lookup address to its image and symbol.
///
/// Returns `None` when the address lies outside every loaded image. Resolution
/// must be a pure function of the loaded-image state: the same address always
/// yields the same answer.
pub trait SymbolResolver {
    fn resolve(&self, lookup_address: usize) -> Option<Symbol>;
}
