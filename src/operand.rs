//! Per-opcode operand decoding.
//!
//! Every instruction carries eight operand bytes. The primitive table picks a
//! schema for them; anything without a schema keeps its raw bytes.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::opcodes::{self, OperandSchema};

/// Variable scopes addressable from an expression operand.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    MyAttribute,
    StackObjectAttribute,
    TargetObjectAttribute,
    MyObjectData,
    StackObjectData,
    TargetObjectData,
    Global,
    Literal,
    Temporary,
    Parameter,
    StackObjectId,
    TemporaryByTemporary,
    TreeAdRange,
    StackObjectTemporary,
    MyMotive,
    StackObjectMotive,
    StackObjectSlot,
    StackObjectMotiveByTemporary,
    MyPersonData,
    StackObjectPersonData,
    MySlot,
    StackObjectDefinition,
    StackObjectAttributeByParameter,
    RoomByTemporary,
    NeighborInStackObject,
    Local,
    Tuning,
}

impl VariableScope {
    const ALL: [VariableScope; 27] = [
        VariableScope::MyAttribute,
        VariableScope::StackObjectAttribute,
        VariableScope::TargetObjectAttribute,
        VariableScope::MyObjectData,
        VariableScope::StackObjectData,
        VariableScope::TargetObjectData,
        VariableScope::Global,
        VariableScope::Literal,
        VariableScope::Temporary,
        VariableScope::Parameter,
        VariableScope::StackObjectId,
        VariableScope::TemporaryByTemporary,
        VariableScope::TreeAdRange,
        VariableScope::StackObjectTemporary,
        VariableScope::MyMotive,
        VariableScope::StackObjectMotive,
        VariableScope::StackObjectSlot,
        VariableScope::StackObjectMotiveByTemporary,
        VariableScope::MyPersonData,
        VariableScope::StackObjectPersonData,
        VariableScope::MySlot,
        VariableScope::StackObjectDefinition,
        VariableScope::StackObjectAttributeByParameter,
        VariableScope::RoomByTemporary,
        VariableScope::NeighborInStackObject,
        VariableScope::Local,
        VariableScope::Tuning,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            VariableScope::MyAttribute => "my attribute",
            VariableScope::StackObjectAttribute => "stack object attribute",
            VariableScope::TargetObjectAttribute => "target object attribute",
            VariableScope::MyObjectData => "my data",
            VariableScope::StackObjectData => "stack object data",
            VariableScope::TargetObjectData => "target object data",
            VariableScope::Global => "global",
            VariableScope::Literal => "literal",
            VariableScope::Temporary => "temp",
            VariableScope::Parameter => "param",
            VariableScope::StackObjectId => "stack object id",
            VariableScope::TemporaryByTemporary => "temp by temp",
            VariableScope::TreeAdRange => "tree ad range",
            VariableScope::StackObjectTemporary => "stack object temp",
            VariableScope::MyMotive => "my motive",
            VariableScope::StackObjectMotive => "stack object motive",
            VariableScope::StackObjectSlot => "stack object slot",
            VariableScope::StackObjectMotiveByTemporary => "stack object motive by temp",
            VariableScope::MyPersonData => "my person data",
            VariableScope::StackObjectPersonData => "stack object person data",
            VariableScope::MySlot => "my slot",
            VariableScope::StackObjectDefinition => "stack object definition",
            VariableScope::StackObjectAttributeByParameter => "stack object attribute by param",
            VariableScope::RoomByTemporary => "room by temp",
            VariableScope::NeighborInStackObject => "neighbor in stack object",
            VariableScope::Local => "local",
            VariableScope::Tuning => "tuning",
        }
    }

    /// Scopes holding read-only values.
    pub fn is_constant(self) -> bool {
        matches!(self, VariableScope::Literal | VariableScope::Tuning)
    }
}

/// A decoded variable reference: scope plus the interpretation of its data
/// field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariableRef {
    /// Signed constant embedded in the instruction.
    Literal { value: i16 },
    /// Entry of a tuning lookup table.
    Tuning { table: u16, key: u16 },
    /// Any other scope; the data field is an index.
    Indexed { scope: VariableScope, index: u16 },
    /// Scope code outside the known range.
    Unknown { code: u8, data: u16 },
}

impl VariableRef {
    pub fn decode(scope_code: u8, data: u16) -> Self {
        match VariableScope::from_code(scope_code) {
            Some(VariableScope::Literal) => VariableRef::Literal { value: data as i16 },
            Some(VariableScope::Tuning) => VariableRef::Tuning {
                table: data >> 7,
                key: data & 0x7F,
            },
            Some(scope) => VariableRef::Indexed { scope, index: data },
            None => VariableRef::Unknown {
                code: scope_code,
                data,
            },
        }
    }

    pub fn scope(&self) -> Option<VariableScope> {
        match self {
            VariableRef::Literal { .. } => Some(VariableScope::Literal),
            VariableRef::Tuning { .. } => Some(VariableScope::Tuning),
            VariableRef::Indexed { scope, .. } => Some(*scope),
            VariableRef::Unknown { .. } => None,
        }
    }

    /// Storage slot as a `(scope, index)` pair, for scopes that name storage.
    pub fn slot(&self) -> Option<(VariableScope, u16)> {
        match self {
            VariableRef::Indexed { scope, index } => Some((*scope, *index)),
            _ => None,
        }
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableRef::Literal { value } => write!(f, "literal {value}"),
            VariableRef::Tuning { table, key } => write!(f, "tuning[{table}:{key}]"),
            VariableRef::Indexed { scope, index } => write!(f, "{}[{index}]", scope.name()),
            VariableRef::Unknown { code, data } => write!(f, "scope#{code}[{data}]"),
        }
    }
}

/// Expression operator codes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionOperator {
    GreaterThan,
    LessThan,
    Equal,
    Add,
    Subtract,
    Assign,
    Multiply,
    Divide,
    IsFlagSet,
    SetFlag,
    ClearFlag,
    IncrementAndLess,
    Modulo,
    BitAnd,
    GreaterOrEqual,
    LessOrEqual,
    NotEqual,
    DecrementAndGreater,
    Push,
    Pop,
    Unknown(u8),
}

/// What an operator does with its operands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperatorKind {
    /// Tests the operands and branches.
    Comparison,
    /// Writes the left operand and always succeeds.
    Assignment,
    /// Writes the left operand, then branches on a test of the result.
    ModifyAndTest,
}

impl ExpressionOperator {
    pub fn from_code(code: u8) -> Self {
        use ExpressionOperator::*;
        match code {
            0 => GreaterThan,
            1 => LessThan,
            2 => Equal,
            3 => Add,
            4 => Subtract,
            5 => Assign,
            6 => Multiply,
            7 => Divide,
            8 => IsFlagSet,
            9 => SetFlag,
            10 => ClearFlag,
            11 => IncrementAndLess,
            12 => Modulo,
            13 => BitAnd,
            14 => GreaterOrEqual,
            15 => LessOrEqual,
            16 => NotEqual,
            17 => DecrementAndGreater,
            18 => Push,
            19 => Pop,
            other => Unknown(other),
        }
    }

    /// `None` for unknown codes.
    pub fn kind(self) -> Option<OperatorKind> {
        use ExpressionOperator::*;
        match self {
            GreaterThan | LessThan | Equal | IsFlagSet | GreaterOrEqual | LessOrEqual
            | NotEqual => Some(OperatorKind::Comparison),
            Add | Subtract | Assign | Multiply | Divide | SetFlag | ClearFlag | Modulo | BitAnd
            | Push | Pop => Some(OperatorKind::Assignment),
            IncrementAndLess | DecrementAndGreater => Some(OperatorKind::ModifyAndTest),
            Unknown(_) => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        use ExpressionOperator::*;
        match self {
            GreaterThan => ">",
            LessThan => "<",
            Equal => "==",
            Add => "+=",
            Subtract => "-=",
            Assign => ":=",
            Multiply => "*=",
            Divide => "/=",
            IsFlagSet => "flag set?",
            SetFlag => "set flag",
            ClearFlag => "clear flag",
            IncrementAndLess => "++ and <",
            Modulo => "%=",
            BitAnd => "&=",
            GreaterOrEqual => ">=",
            LessOrEqual => "<=",
            NotEqual => "!=",
            DecrementAndGreater => "-- and >",
            Push => "push",
            Pop => "pop",
            Unknown(_) => "?",
        }
    }

    pub fn reads_lhs(self) -> bool {
        !matches!(
            self,
            ExpressionOperator::Assign | ExpressionOperator::Pop | ExpressionOperator::Unknown(_)
        )
    }

    pub fn writes_lhs(self) -> bool {
        matches!(
            self.kind(),
            Some(OperatorKind::Assignment | OperatorKind::ModifyAndTest)
        ) && self != ExpressionOperator::Push
    }

    pub fn reads_rhs(self) -> bool {
        !matches!(
            self,
            ExpressionOperator::Push | ExpressionOperator::Pop | ExpressionOperator::Unknown(_)
        )
    }

    /// Net effect on the found-action stack.
    pub fn stack_effect(self) -> i8 {
        match self {
            ExpressionOperator::Push => 1,
            ExpressionOperator::Pop => -1,
            _ => 0,
        }
    }
}

/// Comparison/assignment operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ExpressionOperand {
    pub lhs: VariableRef,
    pub rhs: VariableRef,
    pub operator: ExpressionOperator,
    /// Raw assignment flag bit as encoded.
    pub assignment_flag: bool,
}

impl ExpressionOperand {
    /// Comparisons and modify-and-test operators branch; unknown operators are
    /// treated as branching so neither successor is hidden.
    pub fn branches(&self) -> bool {
        !matches!(self.operator.kind(), Some(OperatorKind::Assignment))
    }
}

/// Subroutine call operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct CallOperand {
    pub target: u16,
    pub params: [u8; 4],
    /// The call is encoded in the opcode rather than through the gosub
    /// primitive.
    pub implicit: bool,
}

/// Typed operand of an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum Operand {
    Expression(ExpressionOperand),
    Call(CallOperand),
    Raw { bytes: [u8; 8] },
}

/// Which side of an expression an issue refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Lhs,
    Rhs,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Lhs => f.write_str("left"),
            Side::Rhs => f.write_str("right"),
        }
    }
}

/// Structural problem found while decoding an operand. These feed the
/// profile's validation counters; none of them stop decoding.
#[derive(Clone, Debug, Eq, Error, PartialEq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum OperandIssue {
    #[error("unknown {side} variable scope code {code}")]
    UnknownScope { side: Side, code: u8 },
    #[error("unknown expression operator code {code}")]
    UnknownOperator { code: u8 },
    #[error("assignment flag is {flag} but operator `{symbol}` disagrees")]
    FlagMismatch { flag: bool, symbol: &'static str },
    #[error("operator `{symbol}` writes to constant {target}")]
    ConstantWrite { symbol: &'static str, target: String },
}

/// Operand together with the issues found while decoding it.
#[derive(Clone, Debug)]
pub struct DecodedOperand {
    pub operand: Operand,
    pub issues: Vec<OperandIssue>,
}

/// Decode the eight operand bytes of `opcode`.
pub fn decode_operand(opcode: u16, bytes: [u8; 8]) -> DecodedOperand {
    if opcodes::is_subroutine_call(opcode) {
        let operand = Operand::Call(CallOperand {
            target: opcode,
            params: [bytes[0], bytes[1], bytes[2], bytes[3]],
            implicit: true,
        });
        return DecodedOperand {
            operand,
            issues: Vec::new(),
        };
    }

    let schema = opcodes::primitive(opcode).map_or(OperandSchema::Raw, |p| p.schema);
    match schema {
        OperandSchema::Expression => decode_expression(bytes),
        OperandSchema::Call => DecodedOperand {
            operand: Operand::Call(CallOperand {
                target: u16::from_le_bytes([bytes[0], bytes[1]]),
                params: [bytes[2], bytes[3], bytes[4], bytes[5]],
                implicit: false,
            }),
            issues: Vec::new(),
        },
        OperandSchema::Raw => DecodedOperand {
            operand: Operand::Raw { bytes },
            issues: Vec::new(),
        },
    }
}

fn decode_expression(bytes: [u8; 8]) -> DecodedOperand {
    let lhs_data = u16::from_le_bytes([bytes[0], bytes[1]]);
    let rhs_data = u16::from_le_bytes([bytes[2], bytes[3]]);
    let assignment_flag = bytes[4] & 0x01 != 0;
    let operator = ExpressionOperator::from_code(bytes[5]);
    let lhs = VariableRef::decode(bytes[6], lhs_data);
    let rhs = VariableRef::decode(bytes[7], rhs_data);

    let mut issues = Vec::new();
    if let VariableRef::Unknown { code, .. } = lhs {
        issues.push(OperandIssue::UnknownScope {
            side: Side::Lhs,
            code,
        });
    }
    if operator.reads_rhs() {
        if let VariableRef::Unknown { code, .. } = rhs {
            issues.push(OperandIssue::UnknownScope {
                side: Side::Rhs,
                code,
            });
        }
    }
    match operator.kind() {
        None => issues.push(OperandIssue::UnknownOperator { code: bytes[5] }),
        Some(kind) => {
            let expects_flag = kind == OperatorKind::Assignment;
            if assignment_flag != expects_flag {
                issues.push(OperandIssue::FlagMismatch {
                    flag: assignment_flag,
                    symbol: operator.symbol(),
                });
            }
        }
    }
    if operator.writes_lhs() && lhs.scope().is_some_and(VariableScope::is_constant) {
        issues.push(OperandIssue::ConstantWrite {
            symbol: operator.symbol(),
            target: lhs.to_string(),
        });
    }

    DecodedOperand {
        operand: Operand::Expression(ExpressionOperand {
            lhs,
            rhs,
            operator,
            assignment_flag,
        }),
        issues,
    }
}
