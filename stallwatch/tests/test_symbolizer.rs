use stallwatch::stack::{capture_current_thread, lookup_address, symbolize_all};
use stallwatch::symbolization::{DwarfResolver, LoaderSymbolizer, SymbolResolver, Symbolizer};

#[inline(never)]
fn marker_function_for_symbolization() -> usize {
    std::hint::black_box(42)
}

#[test]
fn test_symbolizer_creation() {
    // The demo binary carries debug info in test builds
    let binary_path = env!("CARGO_BIN_EXE_stallwatch");

    println!("Testing symbolizer creation on: {binary_path}");

    let symbolizer = Symbolizer::new(binary_path);
    assert!(symbolizer.is_ok(), "Failed to create symbolizer: {:?}", symbolizer.err());
}

#[test]
fn test_symbolizer_resolves_function_names() {
    let binary_path = env!("CARGO_BIN_EXE_stallwatch");
    let symbolizer = Symbolizer::new(binary_path).expect("Failed to create symbolizer");

    // Function addresses from nm; skip quietly where binutils is missing
    let Ok(nm_output) = std::process::Command::new("nm").args(["-C", binary_path]).output() else {
        println!("nm not available, skipping");
        return;
    };
    let symbols = String::from_utf8_lossy(&nm_output.stdout);

    let mut attempts = 0;
    let mut found_valid_symbol = false;
    for line in symbols.lines().filter(|l| l.contains(" T ")).take(5) {
        let Some(addr) = line.split_whitespace().next().and_then(|a| u64::from_str_radix(a, 16).ok())
        else {
            continue;
        };
        attempts += 1;
        let resolved = symbolizer.resolve(addr);
        println!("0x{addr:x} ({line}) -> {}", resolved.label());
        if resolved.is_known() {
            found_valid_symbol = true;
            break;
        }
    }

    assert!(
        attempts == 0 || found_valid_symbol,
        "Symbolizer should resolve at least one of {attempts} addresses to a function name"
    );
}

#[test]
fn test_dwarf_resolver_names_function_in_this_binary() {
    let resolver = DwarfResolver::for_current_exe().expect("Failed to build DWARF resolver");
    let address = lookup_address(marker_function_for_symbolization as *const () as usize, true);

    let resolved = resolver.resolve_frame(address).expect("Address outside the executable");
    assert!(
        resolved.frames.iter().any(|f| f.function.contains("marker_function_for_symbolization")),
        "resolved to {}",
        resolved.label()
    );
    assert!(resolver.resolve(address).and_then(|s| s.symbol_name).is_some());
    assert_eq!(marker_function_for_symbolization(), 42);
}

#[test]
fn test_resolution_is_stable() {
    let loader = LoaderSymbolizer::new();
    let address = lookup_address(marker_function_for_symbolization as *const () as usize, true);
    assert_eq!(loader.resolve(address), loader.resolve(address));
}

#[test]
fn test_captured_frames_symbolize() {
    let stack = capture_current_thread(0, 64);
    assert!(!stack.is_empty());

    let frames = symbolize_all(stack.addresses(), stack.leading_pc(), LoaderSymbolizer::global());
    assert_eq!(frames.len(), stack.depth());
    // At least libc or the test harness exports something on the way up
    assert!(frames.iter().any(|f| f.symbol_name.is_some()), "{frames:#?}");
}

#[inline(never)]
fn self_capture_caller_marker() -> stallwatch::stack::CapturedStack {
    let stack = capture_current_thread(0, 64);
    std::hint::black_box(&stack);
    stack
}

#[test]
fn test_self_capture_starts_at_caller() {
    let resolver = DwarfResolver::for_current_exe().expect("Failed to build DWARF resolver");
    let stack = self_capture_caller_marker();
    let innermost = stack.innermost().expect("captured no frames");

    let resolved = resolver
        .resolve_frame(lookup_address(innermost, stack.leading_pc()))
        .expect("Innermost frame outside the executable");
    assert!(
        resolved.frames.iter().any(|f| f.function.contains("self_capture_caller_marker")),
        "first frame resolved to {}",
        resolved.label()
    );
}
