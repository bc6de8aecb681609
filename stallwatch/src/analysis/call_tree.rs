//! Weighted call-tree aggregation.
//!
//! Many captured stacks, each weighted by the CPU it burned, are merged into
//! one ranked forest of [`AddressFrameNode`]s.
//!
//! # Architecture
//!
//! - **`CallTreeAggregator`** - Bounded pool the checker appends to
//! - **`CallTreeHandle`** - Frozen snapshot swapped out of the pool
//! - **`build_forest()`** - Merge, rank, then symbolize
//!
//! ## Data Flow
//!
//! ```text
//! checker thread                        builder thread
//!     │
//!     ├──► add_stack()   (lock: push)
//!     │
//!     └──► snapshot_and_reset()         (lock: swap in an empty pool)
//!               │
//!               └──────────────────────► build_tree()
//!                                          merge chains     (no lock)
//!                                          sort children
//!                                          symbolize nodes
//! ```
//!
//! # Performance
//!
//! - Merge: O(stacks × depth × siblings)
//! - Symbolization dominates, so it runs once per node and only after sorting
//! - Sampling never waits on a build: the pool lock covers push and swap only

use crossbeam_channel::{bounded, Receiver};
use log::{debug, info, warn};
use std::cmp::Reverse;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::detection::RingBuffer;
use crate::domain::{CpuPercent, EngineError};
use crate::stack::{lookup_address, CapturedStack, ASYNC_BOUNDARY};
use crate::symbolization::{LoaderSymbolizer, SymbolResolver};

/// Label given to sentinel nodes instead of a resolved symbol
pub const ASYNC_BOUNDARY_LABEL: &str = "<async boundary>";

// =============================================================================
// TREE NODES
// =============================================================================

/// One node of the merged call tree.
///
/// Siblings never share an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressFrameNode {
    pub address: usize,
    pub repeat_count: u32,
    pub repeat_count_background: u32,
    pub children: Vec<AddressFrameNode>,
    /// Every merged occurrence was an interrupted program counter, so the
    /// address is looked up as-is rather than as a return address
    pub program_counter: bool,
    pub resolved_symbol: Option<String>,
}

impl AddressFrameNode {
    fn new(address: usize, weight: u32, background_weight: u32, program_counter: bool) -> Self {
        Self {
            address,
            repeat_count: weight,
            repeat_count_background: background_weight,
            children: Vec::new(),
            program_counter,
            resolved_symbol: None,
        }
    }

    #[must_use]
    pub fn is_async_boundary(&self) -> bool {
        self.address == ASYNC_BOUNDARY
    }

    /// Follow the heaviest child at every level, root first
    #[must_use]
    pub fn heaviest_path(&self) -> Vec<&AddressFrameNode> {
        let mut path = vec![self];
        let mut node = self;
        while let Some(child) = node.children.first() {
            path.push(child);
            node = child;
        }
        path
    }

    /// Number of nodes in this subtree, itself included
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(AddressFrameNode::node_count).sum::<usize>()
    }
}

/// Roots are distinct outermost addresses, heaviest first
pub type Forest = Vec<AddressFrameNode>;

// =============================================================================
// WEIGHTED STACKS
// =============================================================================

/// A captured stack with the weight it contributes to every node on its chain
#[derive(Debug, Clone)]
pub struct WeightedStack {
    pub stack: Arc<CapturedStack>,
    pub weight: u32,
    pub is_background: bool,
}

impl WeightedStack {
    /// Weight is `floor(cpu_percent / weight_divisor)`
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_cpu(
        stack: Arc<CapturedStack>,
        cpu: CpuPercent,
        weight_divisor: f32,
        is_background: bool,
    ) -> Self {
        let weight = if weight_divisor > 0.0 && cpu.0 > 0.0 {
            (cpu.0 / weight_divisor).floor() as u32
        } else {
            0
        };
        Self { stack, weight, is_background }
    }

    #[must_use]
    pub fn with_weight(stack: Arc<CapturedStack>, weight: u32, is_background: bool) -> Self {
        Self { stack, weight, is_background }
    }
}

// =============================================================================
// MERGE / RANK / SYMBOLIZE
// =============================================================================

/// Merge `stacks`, rank every level by weight, then symbolize each node
#[must_use]
pub fn build_forest(stacks: &[WeightedStack], resolver: &dyn SymbolResolver) -> Forest {
    let mut forest = Forest::new();
    for weighted in stacks {
        merge_stack(&mut forest, weighted);
    }
    sort_by_weight(&mut forest);
    symbolize(&mut forest, resolver);
    forest
}

/// Merge one stack into the forest as a root-first chain
pub fn merge_stack(forest: &mut Forest, weighted: &WeightedStack) {
    let stack = &weighted.stack;
    if stack.is_empty() {
        return;
    }
    let weight = weighted.weight;
    let background_weight = if weighted.is_background { weight } else { 0 };
    // Outermost address is the root; only the innermost can be a live PC
    let chain: Vec<usize> = stack.addresses().iter().rev().copied().collect();
    let leaf_is_pc = stack.leading_pc();
    let last = chain.len() - 1;

    let mut level: &mut Vec<AddressFrameNode> = forest;
    for (i, &address) in chain.iter().enumerate() {
        let is_pc = leaf_is_pc && i == last;
        match level.iter().position(|node| node.address == address) {
            Some(index) => {
                let node = &mut level[index];
                node.repeat_count = node.repeat_count.saturating_add(weight);
                node.repeat_count_background =
                    node.repeat_count_background.saturating_add(background_weight);
                node.program_counter &= is_pc;
                // A childless node adopts the rest of the chain below as new siblings
                level = &mut node.children;
            }
            None => {
                level.push(linear_chain(&chain[i..], weight, background_weight, leaf_is_pc));
                return;
            }
        }
    }
}

/// Build a single-path subtree from a root-first chain
fn linear_chain(
    chain: &[usize],
    weight: u32,
    background_weight: u32,
    leaf_is_pc: bool,
) -> AddressFrameNode {
    let last = chain.len() - 1;
    let mut below: Option<AddressFrameNode> = None;
    for (i, &address) in chain.iter().enumerate().rev() {
        let mut node =
            AddressFrameNode::new(address, weight, background_weight, leaf_is_pc && i == last);
        node.children.extend(below.take());
        below = Some(node);
    }
    below.unwrap_or_else(|| AddressFrameNode::new(0, weight, background_weight, false))
}

/// Heaviest first at every level; ties keep first-merged order
pub fn sort_by_weight(nodes: &mut [AddressFrameNode]) {
    nodes.sort_by_key(|node| Reverse(node.repeat_count));
    for node in nodes {
        sort_by_weight(&mut node.children);
    }
}

fn symbolize(nodes: &mut [AddressFrameNode], resolver: &dyn SymbolResolver) {
    for node in nodes {
        node.resolved_symbol = if node.is_async_boundary() {
            Some(ASYNC_BOUNDARY_LABEL.to_string())
        } else {
            resolver
                .resolve(lookup_address(node.address, node.program_counter))
                .and_then(|symbol| symbol.symbol_name)
        };
        symbolize(&mut node.children, resolver);
    }
}

// =============================================================================
// AGGREGATOR
// =============================================================================

/// A frozen batch of stacks, detached from the aggregator's pool
#[derive(Debug)]
pub struct CallTreeHandle {
    stacks: Vec<WeightedStack>,
}

impl CallTreeHandle {
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Merge, rank and symbolize the snapshot
    #[must_use]
    pub fn build(&self, resolver: &dyn SymbolResolver) -> Forest {
        let forest = build_forest(&self.stacks, resolver);
        debug!(
            "Built call tree: {} stacks, {} roots, {} nodes",
            self.stacks.len(),
            forest.len(),
            forest.iter().map(AddressFrameNode::node_count).sum::<usize>()
        );
        forest
    }
}

/// Bounded pool of CPU-weighted stacks, snapshotted on demand
pub struct CallTreeAggregator {
    pool: Mutex<RingBuffer<WeightedStack>>,
    capacity: usize,
    weight_divisor: f32,
}

impl CallTreeAggregator {
    /// # Errors
    /// Fails if `capacity` is zero or the pool cannot be allocated
    pub fn new(capacity: usize, weight_divisor: f32) -> Result<Self, EngineError> {
        Ok(Self { pool: Mutex::new(RingBuffer::try_new(capacity)?), capacity, weight_divisor })
    }

    fn lock(&self) -> MutexGuard<'_, RingBuffer<WeightedStack>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a stack weighted by the CPU it was sampled at. Once the pool is
    /// full the oldest stack is dropped.
    pub fn add_stack(&self, stack: Arc<CapturedStack>, cpu: CpuPercent, is_background: bool) {
        let weighted = WeightedStack::from_cpu(stack, cpu, self.weight_divisor, is_background);
        self.lock().push_overwriting(weighted);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Swap the pool for a fresh empty one and return the old contents.
    ///
    /// The replacement is allocated before the lock is taken.
    ///
    /// # Errors
    /// Returns [`EngineError::Allocation`] if the replacement pool cannot be
    /// reserved; the current pool is then left untouched.
    pub fn snapshot_and_reset(&self) -> Result<CallTreeHandle, EngineError> {
        let fresh = RingBuffer::try_new(self.capacity)?;
        let frozen = std::mem::replace(&mut *self.lock(), fresh);
        let mut stacks: Vec<WeightedStack> = frozen.iter_newest_to_oldest().cloned().collect();
        // Oldest first, so merge order follows capture order
        stacks.reverse();
        Ok(CallTreeHandle { stacks })
    }

    /// Build the forest for `handle` against the dynamic loader's symbols
    #[must_use]
    pub fn build_tree(&self, handle: &CallTreeHandle) -> Forest {
        handle.build(LoaderSymbolizer::global())
    }

    #[must_use]
    pub fn build_tree_with(&self, handle: &CallTreeHandle, resolver: &dyn SymbolResolver) -> Forest {
        handle.build(resolver)
    }

    /// Build `handle` on a dedicated thread; the forest arrives on the
    /// returned channel.
    ///
    /// # Errors
    /// Returns [`EngineError::SpawnFailed`] if the thread cannot be started
    pub fn spawn_build(&self, handle: CallTreeHandle) -> Result<Receiver<Forest>, EngineError> {
        let (tx, rx) = bounded(1);
        let stacks = handle.len();
        std::thread::Builder::new()
            .name("stallwatch-tree".into())
            .spawn(move || {
                let forest = handle.build(LoaderSymbolizer::global());
                if tx.send(forest).is_err() {
                    warn!("Call tree receiver dropped before the build finished");
                }
            })
            .map_err(|source| EngineError::SpawnFailed { name: "call tree builder", source })?;
        info!("Building call tree from {stacks} stacks off the sampling thread");
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolization::Symbol;

    const X: usize = 0x1000;
    const Y: usize = 0x2000;
    const Z: usize = 0x3000;
    const W: usize = 0x4000;

    /// Names every address after itself
    struct HexResolver;

    impl SymbolResolver for HexResolver {
        fn resolve(&self, address: usize) -> Option<Symbol> {
            Some(Symbol {
                image_base: 0,
                image_name: None,
                symbol_base: Some(address),
                symbol_name: Some(format!("sym_{address:x}")),
            })
        }
    }

    /// Root-first chain → innermost-first stack
    fn weighted(root_first: &[usize], weight: u32, background: bool) -> WeightedStack {
        let inner_first: Vec<usize> = root_first.iter().rev().copied().collect();
        WeightedStack::with_weight(
            Arc::new(CapturedStack::from_addresses(inner_first, 100, false)),
            weight,
            background,
        )
    }

    fn shape(node: &AddressFrameNode) -> String {
        let children: Vec<String> = node.children.iter().map(shape).collect();
        if children.is_empty() {
            format!("{:x}({})", node.address, node.repeat_count)
        } else {
            format!("{:x}({})[{}]", node.address, node.repeat_count, children.join(","))
        }
    }

    #[test]
    fn test_identical_chains_merge() {
        let forest =
            build_forest(&[weighted(&[X, Y, Z], 3, false), weighted(&[X, Y, Z], 4, false)], &HexResolver);
        assert_eq!(forest.len(), 1);
        assert_eq!(shape(&forest[0]), "1000(7)[2000(7)[3000(7)]]");
    }

    #[test]
    fn test_divergent_chains_branch_heaviest_first() {
        let forest =
            build_forest(&[weighted(&[X, Y], 2, false), weighted(&[X, W], 5, false)], &HexResolver);
        assert_eq!(shape(&forest[0]), "1000(7)[4000(5),2000(2)]");
    }

    #[test]
    fn test_distinct_roots() {
        let forest = build_forest(
            &[weighted(&[X, Y], 1, false), weighted(&[Z], 6, false), weighted(&[X], 1, false)],
            &HexResolver,
        );
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].address, Z);
        assert_eq!(shape(&forest[1]), "1000(2)[2000(1)]");
    }

    #[test]
    fn test_childless_node_adopts_subtree() {
        let forest =
            build_forest(&[weighted(&[X], 1, false), weighted(&[X, Y, Z], 2, false)], &HexResolver);
        assert_eq!(shape(&forest[0]), "1000(3)[2000(2)[3000(2)]]");
    }

    #[test]
    fn test_ties_keep_merge_order() {
        let forest = build_forest(
            &[weighted(&[X, Z], 2, false), weighted(&[X, Y], 2, false), weighted(&[X, W], 2, false)],
            &HexResolver,
        );
        let order: Vec<usize> = forest[0].children.iter().map(|n| n.address).collect();
        assert_eq!(order, vec![Z, Y, W]);
    }

    #[test]
    fn test_background_weight_tracked_separately() {
        let forest =
            build_forest(&[weighted(&[X, Y], 3, true), weighted(&[X, Y], 4, false)], &HexResolver);
        assert_eq!(forest[0].repeat_count, 7);
        assert_eq!(forest[0].repeat_count_background, 3);
        assert_eq!(forest[0].children[0].repeat_count_background, 3);
    }

    #[test]
    fn test_symbolized_after_merge() {
        let forest = build_forest(&[weighted(&[X, Y], 1, false)], &HexResolver);
        // Return addresses are looked up one byte early
        let expected = format!("sym_{:x}", lookup_address(X, false));
        assert_eq!(forest[0].resolved_symbol.as_deref(), Some(expected.as_str()));
        assert!(!forest[0].program_counter);
    }

    #[test]
    fn test_program_counter_leaf() {
        let live = WeightedStack::with_weight(
            Arc::new(CapturedStack::from_addresses(vec![Z, Y, X], 100, true)),
            1,
            false,
        );
        let forest = build_forest(&[live.clone()], &HexResolver);
        let leaf = forest[0].heaviest_path()[2];
        assert_eq!(leaf.address, Z);
        assert!(leaf.program_counter);
        assert!(!forest[0].program_counter);

        // Same address seen as a return address elsewhere
        let forest = build_forest(&[live, weighted(&[X, Y, Z, W], 1, false)], &HexResolver);
        assert!(!forest[0].heaviest_path()[2].program_counter);
    }

    #[test]
    fn test_boundary_labelled_not_resolved() {
        let stitched = WeightedStack::with_weight(
            Arc::new(CapturedStack::from_addresses(vec![Z, ASYNC_BOUNDARY, X], 100, true)),
            1,
            false,
        );
        let forest = build_forest(&[stitched], &HexResolver);
        let path = forest[0].heaviest_path();
        assert_eq!(path[1].resolved_symbol.as_deref(), Some(ASYNC_BOUNDARY_LABEL));
    }

    #[test]
    fn test_weight_from_cpu() {
        let stack = Arc::new(CapturedStack::from_addresses(vec![X], 100, true));
        assert_eq!(WeightedStack::from_cpu(Arc::clone(&stack), CpuPercent(99.0), 5.0, false).weight, 19);
        assert_eq!(WeightedStack::from_cpu(Arc::clone(&stack), CpuPercent(4.9), 5.0, false).weight, 0);
        assert_eq!(WeightedStack::from_cpu(stack, CpuPercent(50.0), 0.0, false).weight, 0);
    }

    #[test]
    fn test_empty_stacks_ignored() {
        let empty = WeightedStack::with_weight(Arc::new(CapturedStack::empty()), 5, false);
        assert!(build_forest(&[empty], &HexResolver).is_empty());
    }

    #[test]
    fn test_snapshot_and_reset_swaps_pool() {
        let aggregator = CallTreeAggregator::new(3, 5.0).unwrap();
        for _ in 0..5 {
            aggregator.add_stack(
                Arc::new(CapturedStack::from_addresses(vec![Y, X], 100, true)),
                CpuPercent(50.0),
                false,
            );
        }
        assert_eq!(aggregator.pending(), 3);

        let handle = aggregator.snapshot_and_reset().unwrap();
        assert_eq!(handle.len(), 3);
        assert_eq!(aggregator.pending(), 0);

        let forest = aggregator.build_tree_with(&handle, &HexResolver);
        assert_eq!(shape(&forest[0]), "1000(30)[2000(30)]");
    }

    #[test]
    fn test_spawn_build_delivers_forest() {
        let aggregator = CallTreeAggregator::new(10, 5.0).unwrap();
        aggregator.add_stack(
            Arc::new(CapturedStack::from_addresses(vec![Y, X], 100, true)),
            CpuPercent(25.0),
            false,
        );
        let handle = aggregator.snapshot_and_reset().unwrap();
        let rx = aggregator.spawn_build(handle).unwrap();
        let forest = rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap();
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].repeat_count, 5);
    }
}
