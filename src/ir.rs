use std::fmt;

use serde::Serialize;

use crate::opcodes::{self, Primitive, PrimitiveFlow};
use crate::operand::{Operand, OperandIssue};

/// Where a true/false pointer leads.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PointerTarget {
    Instruction(usize),
    Terminal(Terminal),
    /// Out of range and not a sentinel.
    Invalid(u8),
}

impl PointerTarget {
    pub fn resolve(pointer: u8, instruction_count: usize) -> Self {
        match pointer {
            opcodes::PTR_ERROR => PointerTarget::Terminal(Terminal::Error),
            opcodes::PTR_RETURN_FALSE => PointerTarget::Terminal(Terminal::ReturnFalse),
            opcodes::PTR_RETURN_TRUE => PointerTarget::Terminal(Terminal::ReturnTrue),
            index if (index as usize) < instruction_count => {
                PointerTarget::Instruction(index as usize)
            }
            invalid => PointerTarget::Invalid(invalid),
        }
    }
}

impl fmt::Display for PointerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerTarget::Instruction(index) => write!(f, "{index}"),
            PointerTarget::Terminal(terminal) => write!(f, "{terminal}"),
            PointerTarget::Invalid(raw) => write!(f, "invalid({raw})"),
        }
    }
}

/// Terminal sentinel reached instead of an instruction.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Error,
    ReturnFalse,
    ReturnTrue,
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Terminal::Error => "error",
            Terminal::ReturnFalse => "false",
            Terminal::ReturnTrue => "true",
        })
    }
}

/// How control leaves an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Always continues to the true pointer.
    Continue,
    /// Continues to the true or the false pointer.
    Branch,
}

/// One decoded instruction record.
#[derive(Clone, Debug, Serialize)]
pub struct Instruction {
    pub index: usize,
    pub opcode: u16,
    pub true_pointer: u8,
    pub false_pointer: u8,
    pub raw_operand: [u8; 8],
    pub operand: Operand,
    /// Primitive opcode with no entry in the primitive table.
    pub unknown: bool,
    pub issues: Vec<OperandIssue>,
}

impl Instruction {
    pub fn primitive(&self) -> Option<&'static Primitive> {
        opcodes::primitive(self.opcode)
    }

    pub fn is_subroutine_call(&self) -> bool {
        opcodes::is_subroutine_call(self.opcode)
    }

    /// Script id this instruction calls, for both implicit and explicit calls.
    pub fn call_target(&self) -> Option<u16> {
        match self.operand {
            Operand::Call(call) => Some(call.target),
            _ => None,
        }
    }

    pub fn flow(&self) -> Flow {
        if self.is_subroutine_call() {
            return Flow::Branch;
        }
        match self.primitive().map(|p| p.flow) {
            Some(PrimitiveFlow::Continue) => Flow::Continue,
            Some(PrimitiveFlow::Branch) => Flow::Branch,
            Some(PrimitiveFlow::ByOperand) => match self.operand {
                Operand::Expression(expr) if !expr.branches() => Flow::Continue,
                _ => Flow::Branch,
            },
            // Unknown primitives might branch; keep both successors visible.
            None => Flow::Branch,
        }
    }

    pub fn yields(&self) -> bool {
        self.primitive().is_some_and(|p| p.yields)
    }

    /// Net change of the found-action stack when this instruction runs.
    pub fn stack_effect(&self) -> i32 {
        let base = self.primitive().map_or(0, |p| p.stack_effect as i32);
        match self.operand {
            Operand::Expression(expr) => base + expr.operator.stack_effect() as i32,
            _ => base,
        }
    }

    pub fn true_target(&self, instruction_count: usize) -> PointerTarget {
        PointerTarget::resolve(self.true_pointer, instruction_count)
    }

    pub fn false_target(&self, instruction_count: usize) -> PointerTarget {
        PointerTarget::resolve(self.false_pointer, instruction_count)
    }

    pub fn mnemonic(&self) -> String {
        if self.is_subroutine_call() {
            return format!("call {:#06x}", self.opcode);
        }
        match self.primitive() {
            Some(primitive) => primitive.name.to_string(),
            None => format!("prim {:#06x}", self.opcode),
        }
    }
}

/// One-line disassembly: `0003: expression  local[0] := literal 5  T->4 F->253`.
/// Pointers print as raw bytes so sentinels stay visible.
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}: {}", self.index, self.mnemonic())?;
        match &self.operand {
            Operand::Expression(expr) => {
                write!(f, "  {} {} {}", expr.lhs, expr.operator.symbol(), expr.rhs)?
            }
            Operand::Call(call) if !call.implicit => write!(
                f,
                "  {:#06x} ({} {} {} {})",
                call.target, call.params[0], call.params[1], call.params[2], call.params[3]
            )?,
            Operand::Call(call) => write!(
                f,
                "  ({} {} {} {})",
                call.params[0], call.params[1], call.params[2], call.params[3]
            )?,
            Operand::Raw { bytes } => {
                f.write_str(" ")?;
                for byte in bytes {
                    write!(f, " {byte:02x}")?;
                }
            }
        }
        write!(f, "  T->{} F->{}", self.true_pointer, self.false_pointer)
    }
}

/// Identifier of a basic block inside one graph.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Resolved flow graph of one script.
#[derive(Clone, Debug, Serialize)]
pub struct ControlFlowGraph {
    pub entry: BlockId,
    pub blocks: Vec<BasicBlock>,
    pub edges: Vec<FlowEdge>,
    /// Per instruction: reachable from the entry block.
    pub reachable: Vec<bool>,
}

/// Maximal straight-line run of instructions.
#[derive(Clone, Debug, Serialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub label: String,
    /// Instruction indices in execution order.
    pub instructions: Vec<usize>,
    pub is_loop_head: bool,
    pub reachable: bool,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
}

impl BasicBlock {
    pub fn start(&self) -> usize {
        self.instructions[0]
    }

    pub fn last(&self) -> usize {
        self.instructions[self.instructions.len() - 1]
    }
}

/// Edge from an instruction to its successor.
#[derive(Clone, Debug, Serialize)]
pub struct FlowEdge {
    pub from: usize,
    pub to: EdgeTarget,
    pub kind: EdgeKind,
    pub is_back_edge: bool,
}

/// Resolved destination of a flow edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeTarget {
    Block { block: BlockId, index: usize },
    Terminal { terminal: Terminal },
    Invalid { pointer: u8 },
}

/// Edge classification used for CFG inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    True,
    False,
    Fallthrough,
}
