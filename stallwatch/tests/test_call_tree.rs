use std::sync::Arc;
use std::time::Duration;

use stallwatch::analysis::{CallTreeAggregator, ASYNC_BOUNDARY_LABEL};
use stallwatch::domain::CpuPercent;
use stallwatch::export::{CallTreeExporter, ExportedNode};
use stallwatch::stack::{CapturedStack, ASYNC_BOUNDARY};
use stallwatch::symbolization::{Symbol, SymbolResolver};

/// Names a few fixed addresses, leaves the rest unresolved
struct TableResolver;

impl SymbolResolver for TableResolver {
    fn resolve(&self, address: usize) -> Option<Symbol> {
        let name = match address {
            0x0fff => "main",
            0x1fff => "app::run",
            0x2fff => "app::render",
            _ => return None,
        };
        Some(Symbol {
            image_base: 0,
            image_name: Some("app".into()),
            symbol_base: Some(address),
            symbol_name: Some(name.into()),
        })
    }
}

/// Innermost-first addresses as return addresses
fn stack(addresses: &[usize]) -> Arc<CapturedStack> {
    Arc::new(CapturedStack::from_addresses(addresses.to_vec(), 100, false))
}

#[test]
fn test_weighted_merge_and_export() {
    let aggregator = CallTreeAggregator::new(16, 5.0).unwrap();
    // main → run → render, twice; main → run → 0x4000 once in the background
    aggregator.add_stack(stack(&[0x3000, 0x2000, 0x1000]), CpuPercent(50.0), false);
    aggregator.add_stack(stack(&[0x3000, 0x2000, 0x1000]), CpuPercent(30.0), false);
    aggregator.add_stack(stack(&[0x4000, 0x2000, 0x1000]), CpuPercent(90.0), true);

    let handle = aggregator.snapshot_and_reset().unwrap();
    let forest = aggregator.build_tree_with(&handle, &TableResolver);

    let mut buffer = Vec::new();
    CallTreeExporter::new(&forest).export(&mut buffer).unwrap();
    let roots: Vec<ExportedNode> = serde_json::from_slice(&buffer).unwrap();

    assert_eq!(roots.len(), 1);
    let main = &roots[0];
    assert_eq!(main.address, "0x1000");
    assert_eq!(main.symbol.as_deref(), Some("main"));
    assert_eq!(main.repeat_count, 10 + 6 + 18);
    assert_eq!(main.repeat_count_background, 18);

    let run = &main.children[0];
    assert_eq!(run.symbol.as_deref(), Some("app::run"));
    // Heavier background branch first
    assert_eq!(run.children[0].address, "0x4000");
    assert_eq!(run.children[0].symbol, None);
    assert_eq!(run.children[1].symbol.as_deref(), Some("app::render"));
    assert_eq!(run.children[1].repeat_count, 16);
}

#[test]
fn test_stitched_stacks_keep_boundary_node() {
    let aggregator = CallTreeAggregator::new(4, 1.0).unwrap();
    aggregator.add_stack(stack(&[0x3000, ASYNC_BOUNDARY, 0x2000, 0x1000]), CpuPercent(3.0), false);
    let handle = aggregator.snapshot_and_reset().unwrap();
    let forest = aggregator.build_tree_with(&handle, &TableResolver);

    let path = forest[0].heaviest_path();
    assert_eq!(path.len(), 4);
    assert_eq!(path[2].resolved_symbol.as_deref(), Some(ASYNC_BOUNDARY_LABEL));
}

#[test]
fn test_spawned_build_leaves_pool_usable() {
    let aggregator = CallTreeAggregator::new(4, 5.0).unwrap();
    aggregator.add_stack(stack(&[0x2000, 0x1000]), CpuPercent(100.0), false);
    let rx = aggregator.spawn_build(aggregator.snapshot_and_reset().unwrap()).unwrap();

    // Sampling continues while the tree builds
    aggregator.add_stack(stack(&[0x2000, 0x1000]), CpuPercent(100.0), false);
    assert_eq!(aggregator.pending(), 1);

    let forest = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(forest[0].repeat_count, 20);
}
