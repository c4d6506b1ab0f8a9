use std::collections::{BTreeSet, VecDeque};

use crate::ir::{
    BasicBlock, BlockId, ControlFlowGraph, EdgeKind, EdgeTarget, Flow, FlowEdge, Instruction,
    PointerTarget,
};

/// Build a control flow graph from decoded instructions.
///
/// An instruction starts a new block unless it is the sole successor of the
/// instruction right before it and that instruction always continues into
/// it. Pointers that are neither in range nor a sentinel produce an
/// `EdgeTarget::Invalid` edge instead of failing.
pub fn build_cfg(instructions: &[Instruction]) -> ControlFlowGraph {
    let count = instructions.len();
    let successors: Vec<Vec<(EdgeKind, PointerTarget)>> = instructions
        .iter()
        .map(|inst| successor_targets(inst, count))
        .collect();

    let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
    for (from, targets) in successors.iter().enumerate() {
        for (_, target) in targets {
            if let PointerTarget::Instruction(to) = target {
                predecessors[*to].insert(from);
            }
        }
    }

    let mut blocks: Vec<BasicBlock> = Vec::new();
    let mut block_of = vec![BlockId(0); count];
    for index in 0..count {
        if index == 0 || is_leader(index, instructions, &successors, &predecessors) {
            let id = BlockId(blocks.len());
            blocks.push(BasicBlock {
                id,
                label: id.to_string(),
                instructions: Vec::new(),
                is_loop_head: false,
                reachable: false,
                predecessors: Vec::new(),
                successors: Vec::new(),
            });
        }
        let current = blocks.len() - 1;
        blocks[current].instructions.push(index);
        block_of[index] = BlockId(current);
    }

    let mut edges = Vec::new();
    for (from, targets) in successors.iter().enumerate() {
        for (kind, target) in targets {
            let mut kind = *kind;
            let (to, is_back_edge) = match *target {
                PointerTarget::Instruction(index) => {
                    let block = block_of[index];
                    let head = blocks[block.0].start();
                    // A continuing step into the next instruction that a
                    // leader split off.
                    if instructions[from].flow() == Flow::Continue
                        && index == from + 1
                        && index == head
                    {
                        kind = EdgeKind::Fallthrough;
                    }
                    (
                        EdgeTarget::Block { block, index },
                        index == head && head <= from,
                    )
                }
                PointerTarget::Terminal(terminal) => (EdgeTarget::Terminal { terminal }, false),
                PointerTarget::Invalid(pointer) => (EdgeTarget::Invalid { pointer }, false),
            };
            edges.push(FlowEdge {
                from,
                to,
                kind,
                is_back_edge,
            });
        }
    }

    link_blocks(&mut blocks, &block_of, &edges);
    let reachable = mark_reachable(&mut blocks, count);

    ControlFlowGraph {
        entry: BlockId(0),
        blocks,
        edges,
        reachable,
    }
}

fn successor_targets(inst: &Instruction, count: usize) -> Vec<(EdgeKind, PointerTarget)> {
    match inst.flow() {
        Flow::Continue => vec![(EdgeKind::True, inst.true_target(count))],
        Flow::Branch => vec![
            (EdgeKind::True, inst.true_target(count)),
            (EdgeKind::False, inst.false_target(count)),
        ],
    }
}

fn is_leader(
    index: usize,
    instructions: &[Instruction],
    successors: &[Vec<(EdgeKind, PointerTarget)>],
    predecessors: &[BTreeSet<usize>],
) -> bool {
    let previous = index - 1;
    let continues_here = instructions[previous].flow() == Flow::Continue
        && successors[previous]
            .iter()
            .all(|(_, target)| *target == PointerTarget::Instruction(index));
    let only_from_previous =
        predecessors[index].len() == 1 && predecessors[index].contains(&previous);
    !(continues_here && only_from_previous)
}

fn link_blocks(blocks: &mut [BasicBlock], block_of: &[BlockId], edges: &[FlowEdge]) {
    let mut links = BTreeSet::new();
    for edge in edges {
        let EdgeTarget::Block { block, index } = edge.to else {
            continue;
        };
        let source = block_of[edge.from];
        // Sequential steps inside a block are not block links.
        if source == block && index != blocks[block.0].start() {
            continue;
        }
        links.insert((source, block));
    }
    for (source, target) in links {
        blocks[source.0].successors.push(target);
        blocks[target.0].predecessors.push(source);
    }
    for edge in edges.iter().filter(|edge| edge.is_back_edge) {
        if let EdgeTarget::Block { block, .. } = edge.to {
            blocks[block.0].is_loop_head = true;
        }
    }
}

fn mark_reachable(blocks: &mut [BasicBlock], count: usize) -> Vec<bool> {
    let mut reachable = vec![false; count];
    if blocks.is_empty() {
        return reachable;
    }
    let mut queue = VecDeque::from([BlockId(0)]);
    blocks[0].reachable = true;
    while let Some(id) = queue.pop_front() {
        for &index in &blocks[id.0].instructions {
            reachable[index] = true;
        }
        let successors = blocks[id.0].successors.clone();
        for next in successors {
            if !blocks[next.0].reachable {
                blocks[next.0].reachable = true;
                queue.push_back(next);
            }
        }
    }
    reachable
}

impl ControlFlowGraph {
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0)
    }

    pub fn block_of(&self, index: usize) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|block| block.instructions.contains(&index))
            .map(|block| block.id)
    }

    pub fn edges_from(&self, index: usize) -> impl Iterator<Item = &FlowEdge> {
        self.edges.iter().filter(move |edge| edge.from == index)
    }

    pub fn back_edges(&self) -> impl Iterator<Item = &FlowEdge> {
        self.edges.iter().filter(|edge| edge.is_back_edge)
    }

    /// A back-edge leaves a reachable instruction.
    pub fn has_loops(&self) -> bool {
        self.back_edges()
            .any(|edge| self.reachable.get(edge.from).copied().unwrap_or(false))
    }

    pub fn dead_instructions(&self) -> Vec<usize> {
        self.reachable
            .iter()
            .enumerate()
            .filter(|(_, reachable)| !**reachable)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn loop_heads(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter().filter(|block| block.is_loop_head)
    }
}
