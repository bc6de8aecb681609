//! Dynamic-loader symbol lookup with an address-range cache

use log::debug;
use rustc_demangle::demangle;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use super::{Symbol, SymbolResolver};

/// Ranges kept before the cache is dropped and rebuilt
const MAX_CACHED_RANGES: usize = 4096;

struct CachedRange {
    /// Highest address already known to resolve to this symbol
    covered_upto: usize,
    symbol: Symbol,
}

/// Resolves addresses through `dladdr`.
///
/// Once `dladdr(a)` reports symbol base `s`, every address in `[s, a]` has the
/// same nearest preceding symbol, so the whole range is cached under `s`.
pub struct LoaderSymbolizer {
    ranges: Mutex<BTreeMap<usize, CachedRange>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cache counters, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub ranges: usize,
}

impl LoaderSymbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ranges: Mutex::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Process-wide instance
    pub fn global() -> &'static LoaderSymbolizer {
        static GLOBAL: OnceLock<LoaderSymbolizer> = OnceLock::new();
        GLOBAL.get_or_init(LoaderSymbolizer::new)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ranges: self.ranges.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    fn cached(&self, address: usize) -> Option<Symbol> {
        let ranges = self.ranges.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, entry) = ranges.range(..=address).next_back()?;
        (address <= entry.covered_upto).then(|| entry.symbol.clone())
    }

    fn remember(&self, address: usize, symbol: &Symbol) {
        let Some(base) = symbol.symbol_base else {
            return;
        };
        if base > address {
            return;
        }
        let mut ranges = self.ranges.lock().unwrap_or_else(PoisonError::into_inner);
        if ranges.len() >= MAX_CACHED_RANGES && !ranges.contains_key(&base) {
            debug!("Symbol range cache full ({MAX_CACHED_RANGES} ranges), clearing");
            ranges.clear();
        }
        ranges
            .entry(base)
            .and_modify(|entry| entry.covered_upto = entry.covered_upto.max(address))
            .or_insert_with(|| CachedRange { covered_upto: address, symbol: symbol.clone() });
    }
}

impl Default for LoaderSymbolizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver for LoaderSymbolizer {
    fn resolve(&self, lookup_address: usize) -> Option<Symbol> {
        if let Some(symbol) = self.cached(lookup_address) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(symbol);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let symbol = dladdr(lookup_address)?;
        self.remember(lookup_address, &symbol);
        Some(symbol)
    }
}

/// Demangle a Rust symbol name; other names pass through unchanged
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    format!("{:#}", demangle(symbol))
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn dladdr(address: usize) -> Option<Symbol> {
    use std::ffi::CStr;

    if address == 0 {
        return None;
    }
    // SAFETY: Dl_info is plain old data; all-zero is a valid value
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdr only inspects the loader's tables for `address`
    let found = unsafe { libc::dladdr(address as *const libc::c_void, &mut info) };
    if found == 0 || info.dli_fbase.is_null() {
        return None;
    }

    // SAFETY: non-null strings from dladdr point into loader-owned memory that
    // lives as long as the image stays loaded
    let image_name = (!info.dli_fname.is_null())
        .then(|| unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned());
    let symbol_name = (!info.dli_sname.is_null())
        .then(|| demangle_symbol(&unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy()));
    let symbol_base = (!info.dli_saddr.is_null()).then_some(info.dli_saddr as usize);

    Some(Symbol {
        image_base: info.dli_fbase as usize,
        image_name,
        symbol_base: symbol_name.as_ref().and(symbol_base),
        symbol_name,
    })
}

#[cfg(not(unix))]
fn dladdr(_address: usize) -> Option<Symbol> {
    None
}
