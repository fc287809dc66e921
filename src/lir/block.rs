//! Blocks and the block graph.

use crate::error::{CodegenError, CodegenResult};
use crate::lir::inst::Inst;
use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

/// Identifies one basic block in a [`BlockGraph`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "block");

/// Linear-scan-relevant flags on a block: whether it opens or closes a loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopFlags {
    pub is_loop_header: bool,
    pub is_loop_end: bool,
}

/// One basic block: identity, CFG edges, loop flags, and an ordered LIR
/// list.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub preds: SmallVec<[BlockId; 4]>,
    pub succs: SmallVec<[BlockId; 2]>,
    pub loop_flags: LoopFlags,
    /// Whether the emitter should align this block's start address.
    pub align: bool,
    pub insts: Vec<Inst>,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Block {
            id,
            preds: SmallVec::new(),
            succs: SmallVec::new(),
            loop_flags: LoopFlags::default(),
            align: false,
            insts: Vec::new(),
        }
    }
}

/// The LIR boundary described by `spec.md` §6: an entry block, two distinct
/// block orderings, and a block list. The def-site map is populated lazily
/// by the allocator's build phase, not supplied up front -- the higher-IR
/// layer (out of scope) does not itself track per-vreg def blocks.
pub struct BlockGraph {
    pub blocks: PrimaryMap<BlockId, Block>,
    pub entry: BlockId,
    /// Order the allocator walks blocks in: reverse-post-order with loop
    /// bodies kept contiguous, so that loop-invariant liveness fixpoints
    /// converge without revisiting unrelated blocks.
    pub linear_scan_order: Vec<BlockId>,
    /// Order the emitter walks blocks in: chosen to maximize fall-through
    /// density rather than dominance order.
    pub code_emission_order: Vec<BlockId>,
}

impl BlockGraph {
    pub fn new(entry: BlockId, blocks: PrimaryMap<BlockId, Block>) -> Self {
        BlockGraph {
            blocks,
            entry,
            linear_scan_order: Vec::new(),
            code_emission_order: Vec::new(),
        }
    }

    /// Compute `linear_scan_order` as a reverse-post-order DFS from `entry`,
    /// and default `code_emission_order` to the same order (a real backend
    /// would instead favor fall-through edges; that policy is left
    /// unspecified here).
    ///
    /// Rejects irreducible input (`spec.md` §6: "The graph must be
    /// reducible with loops identified; irreducible input is rejected"):
    /// a CFG is reducible iff every back-edge's target dominates its
    /// source. This is checked by building a dominator tree (the standard
    /// Cooper/Harvey/Kennedy iterative algorithm over the reverse-post-order
    /// numbering) and then verifying that property for every edge that
    /// points backward in RPO.
    pub fn compute_orders(&mut self) -> CodegenResult<()> {
        let n = self.blocks.len();

        // Predecessors are derived from `succs` here rather than trusted
        // from `Block::preds`, so this check is self-contained even if a
        // caller built the graph without populating `preds`.
        let mut preds: SecondaryMap<BlockId, SmallVec<[BlockId; 4]>> = SecondaryMap::new();
        for (id, block) in self.blocks.iter() {
            for &s in &block.succs {
                preds[s].push(id);
            }
        }

        // Iterative post-order DFS from `entry`.
        let mut postorder: Vec<BlockId> = Vec::with_capacity(n);
        let mut visited: SecondaryMap<BlockId, bool> = SecondaryMap::with_default(false);
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry] = true;

        while let Some((b, child_idx)) = stack.pop() {
            let succs = &self.blocks[b].succs;
            if child_idx < succs.len() {
                let next = succs[child_idx];
                stack.push((b, child_idx + 1));
                if !visited[next] {
                    visited[next] = true;
                    stack.push((next, 0));
                }
            } else {
                postorder.push(b);
            }
        }

        for i in 0..n {
            if !visited[BlockId::new(i)] {
                // Unreachable from entry: not a CFG this allocator can
                // number at all.
                return Err(CodegenError::Irreducible);
            }
        }

        let mut rpo = postorder.clone();
        rpo.reverse();

        let mut rpo_number: SecondaryMap<BlockId, u32> = SecondaryMap::with_default(u32::MAX);
        for (i, &b) in rpo.iter().enumerate() {
            rpo_number[b] = i as u32;
        }
        let mut postorder_number: SecondaryMap<BlockId, i32> = SecondaryMap::with_default(-1);
        for (i, &b) in postorder.iter().enumerate() {
            postorder_number[b] = i as i32;
        }

        let idom = compute_idoms(self.entry, &rpo, &preds, &postorder_number);

        for b in rpo.iter().copied() {
            for &s in &self.blocks[b].succs {
                if rpo_number[s] <= rpo_number[b] && !dominates(s, b, &idom) {
                    return Err(CodegenError::Irreducible);
                }
            }
        }

        self.linear_scan_order = rpo.clone();
        self.code_emission_order = rpo;
        Ok(())
    }
}

/// Cooper/Harvey/Kennedy iterative dominator-tree computation: each node's
/// immediate dominator is the intersection (in the dominator tree, nearest
/// common ancestor by postorder number) of all its already-processed
/// predecessors' immediate dominators.
fn compute_idoms(
    entry: BlockId,
    rpo: &[BlockId],
    preds: &SecondaryMap<BlockId, SmallVec<[BlockId; 4]>>,
    postorder_number: &SecondaryMap<BlockId, i32>,
) -> SecondaryMap<BlockId, Option<BlockId>> {
    let mut idom: SecondaryMap<BlockId, Option<BlockId>> = SecondaryMap::with_default(None);
    idom[entry] = Some(entry);

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &p in preds[b].iter() {
                if idom[p].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(cur, p, &idom, postorder_number),
                });
            }
            if idom[b] != new_idom {
                idom[b] = new_idom;
                changed = true;
            }
        }
    }
    idom
}

fn intersect(
    mut a: BlockId,
    mut b: BlockId,
    idom: &SecondaryMap<BlockId, Option<BlockId>>,
    postorder_number: &SecondaryMap<BlockId, i32>,
) -> BlockId {
    while a != b {
        while postorder_number[a] < postorder_number[b] {
            a = idom[a].expect("processed node has an idom");
        }
        while postorder_number[b] < postorder_number[a] {
            b = idom[b].expect("processed node has an idom");
        }
    }
    a
}

/// Whether `dom` dominates `node` in the tree described by `idom`.
fn dominates(dom: BlockId, mut node: BlockId, idom: &SecondaryMap<BlockId, Option<BlockId>>) -> bool {
    loop {
        if node == dom {
            return true;
        }
        match idom[node] {
            Some(p) if p != node => node = p,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_block(id: u32, succs: &[u32]) -> Block {
        let mut b = Block::new(BlockId::new(id as usize));
        b.succs = succs.iter().map(|&s| BlockId::new(s as usize)).collect();
        b
    }

    #[test]
    fn reverse_post_order_places_preds_before_succs() {
        let mut blocks = PrimaryMap::new();
        blocks.push(mk_block(0, &[1, 2]));
        blocks.push(mk_block(1, &[3]));
        blocks.push(mk_block(2, &[3]));
        blocks.push(mk_block(3, &[]));
        let mut g = BlockGraph::new(BlockId::new(0), blocks);
        g.compute_orders().unwrap();
        let pos = |id: u32| {
            g.linear_scan_order
                .iter()
                .position(|&b| b == BlockId::new(id as usize))
                .unwrap()
        };
        assert!(pos(0) < pos(1));
        assert!(pos(0) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(3));
    }

    #[test]
    fn single_block_loop_is_reducible() {
        let mut blocks = PrimaryMap::new();
        blocks.push(mk_block(0, &[0]));
        let mut g = BlockGraph::new(BlockId::new(0), blocks);
        assert!(g.compute_orders().is_ok());
    }

    #[test]
    fn diamond_with_a_loop_back_to_the_header_is_reducible() {
        // Entry -> A, Entry -> B, A -> C, B -> C, C -> A (a loop whose
        // back-edge target A dominates its source C).
        let mut blocks = PrimaryMap::new();
        blocks.push(mk_block(0, &[1, 2])); // Entry
        blocks.push(mk_block(1, &[3])); // A
        blocks.push(mk_block(2, &[3])); // B
        blocks.push(mk_block(3, &[1])); // C -> A
        let mut g = BlockGraph::new(BlockId::new(0), blocks);
        assert!(g.compute_orders().is_ok());
    }

    #[test]
    fn irreducible_graph_with_two_entries_into_a_loop_is_rejected() {
        // Entry -> A, Entry -> B, A -> B, B -> A: B is reachable without
        // passing through A and vice versa, so neither dominates the other
        // and the A<->B cycle is not a natural loop.
        let mut blocks = PrimaryMap::new();
        blocks.push(mk_block(0, &[1, 2])); // Entry
        blocks.push(mk_block(1, &[2])); // A -> B
        blocks.push(mk_block(2, &[1])); // B -> A
        let mut g = BlockGraph::new(BlockId::new(0), blocks);
        assert_eq!(g.compute_orders(), Err(CodegenError::Irreducible));
    }
}
