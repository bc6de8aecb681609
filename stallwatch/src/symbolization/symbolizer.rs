//! DWARF symbolization of the main executable

use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use log::info;
use object::{Object, ObjectSection};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use super::loader::{demangle_symbol, LoaderSymbolizer};
use super::memory_maps::{parse_memory_maps, MemoryRange};
use super::{Symbol, SymbolResolver};

/// Symbolizer for resolving instruction pointers to source locations
///
/// Includes a cache to avoid re-resolving the same addresses repeatedly,
/// which significantly improves performance when symbolizing call trees.
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    /// Cache of resolved frames by address
    cache: RefCell<HashMap<u64, ResolvedFrame>>,
}

impl Symbolizer {
    /// Create a new symbolizer for the given binary
    ///
    /// # Errors
    /// Returns an error if the binary file cannot be read or parsed, or if DWARF debug info is missing
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Result<Self> {
        let binary_data = fs::read(binary_path.as_ref()).context("Failed to read binary file")?;

        let obj_file = object::File::parse(&*binary_data).context("Failed to parse object file")?;

        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?;

        Ok(Self { ctx, cache: RefCell::new(HashMap::new()) })
    }

    /// Resolve a file-relative address to source location information
    ///
    /// Uses a cache to avoid re-resolving the same address multiple times.
    pub fn resolve(&self, addr: u64) -> ResolvedFrame {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let mut result = Vec::new();

        if let Ok(mut frame_iter) = self.ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let function = frame
                    .function
                    .and_then(|f| f.demangle().ok().map(|s| demangle_symbol(&s)))
                    .unwrap_or_else(|| UNKNOWN.to_string());

                let location = frame.location.map(|loc| SourceLocation {
                    file: loc.file.map(std::string::ToString::to_string),
                    line: loc.line,
                    column: loc.column,
                });

                result.push(InlinedFrame { function, location });
            }
        }

        let resolved = ResolvedFrame {
            addr,
            frames: if result.is_empty() {
                vec![InlinedFrame { function: UNKNOWN.to_string(), location: None }]
            } else {
                result
            },
        };

        self.cache.borrow_mut().insert(addr, resolved.clone());

        resolved
    }
}

const UNKNOWN: &str = "<unknown>";

/// A resolved stack frame (may contain multiple inlined frames)
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub addr: u64,
    pub frames: Vec<InlinedFrame>,
}

/// An inlined frame within a resolved frame
#[derive(Debug, Clone)]
pub struct InlinedFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

/// Source code location
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ResolvedFrame {
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.frames.iter().any(|f| f.function != UNKNOWN)
    }

    /// One-line label: innermost function plus `file:line` when known
    #[must_use]
    pub fn label(&self) -> String {
        let Some(inner) = self.frames.first() else {
            return UNKNOWN.to_string();
        };
        match inner.location.as_ref().and_then(|loc| loc.file.as_ref().zip(loc.line)) {
            Some((file, line)) => format!("{} ({file}:{line})", inner.function),
            None => inner.function.clone(),
        }
    }
}

/// DWARF resolution for the main executable, `dladdr` for everything else.
///
/// Runtime addresses inside the executable's mapping are shifted by its load
/// base before lookup (PIE adjustment); others go to the loader.
pub struct DwarfResolver {
    symbolizer: Symbolizer,
    executable: MemoryRange,
    image_name: String,
}

impl DwarfResolver {
    /// Build a resolver for the running executable
    ///
    /// # Errors
    /// Returns an error if the executable cannot be located, has no DWARF
    /// info, or does not appear in `/proc/self/maps`
    pub fn for_current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        let exe = fs::canonicalize(&exe).unwrap_or(exe);
        let image_name = exe.to_string_lossy().into_owned();
        let symbolizer = Symbolizer::new(&exe)?;
        let executable = parse_memory_maps(std::process::id(), &image_name)?;
        info!("DWARF symbolization enabled for {image_name}");
        Ok(Self { symbolizer, executable, image_name })
    }

    /// Full DWARF resolution of a runtime lookup address, if it lies in the executable
    #[must_use]
    pub fn resolve_frame(&self, lookup_address: usize) -> Option<ResolvedFrame> {
        let (offset, in_executable) = self.adjust_address(lookup_address as u64);
        in_executable.then(|| self.symbolizer.resolve(offset))
    }

    /// Returns (`file_relative_address`, `is_in_executable`)
    fn adjust_address(&self, addr: u64) -> (u64, bool) {
        if self.executable.contains(addr) {
            (addr - self.executable.start, true)
        } else {
            (addr, false)
        }
    }
}

impl SymbolResolver for DwarfResolver {
    #[allow(clippy::cast_possible_truncation)]
    fn resolve(&self, lookup_address: usize) -> Option<Symbol> {
        match self.resolve_frame(lookup_address) {
            Some(resolved) if resolved.is_known() => Some(Symbol {
                image_base: self.executable.start as usize,
                image_name: Some(self.image_name.clone()),
                symbol_base: None,
                symbol_name: Some(resolved.label()),
            }),
            _ => LoaderSymbolizer::global().resolve(lookup_address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: &str, file: Option<&str>, line: Option<u32>) -> ResolvedFrame {
        ResolvedFrame {
            addr: 0x1234,
            frames: vec![InlinedFrame {
                function: function.to_string(),
                location: Some(SourceLocation {
                    file: file.map(str::to_string),
                    line,
                    column: None,
                }),
            }],
        }
    }

    #[test]
    fn test_label_with_location() {
        let resolved = frame("app::run", Some("src/app.rs"), Some(42));
        assert!(resolved.is_known());
        assert_eq!(resolved.label(), "app::run (src/app.rs:42)");
    }

    #[test]
    fn test_label_without_location() {
        let resolved = frame("app::run", None, None);
        assert_eq!(resolved.label(), "app::run");
        assert!(!frame(UNKNOWN, None, None).is_known());
    }

    #[test]
    fn test_label_uses_innermost_inlined_frame() {
        let mut resolved = frame("app::helper", Some("src/helper.rs"), Some(7));
        resolved.frames.push(InlinedFrame { function: "app::run".to_string(), location: None });
        assert_eq!(resolved.label(), "app::helper (src/helper.rs:7)");
    }
}
