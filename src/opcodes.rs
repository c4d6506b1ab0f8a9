//! Primitive opcode table and the fixed constants of the instruction format.

/// Size in bytes of one encoded instruction record.
pub const INSTRUCTION_SIZE: usize = 12;

/// Opcodes at or above this value call the subroutine whose id is the opcode.
pub const SUBROUTINE_THRESHOLD: u16 = 0x0100;

/// Pointer value meaning "propagate an error to the caller".
pub const PTR_ERROR: u8 = 253;
/// Pointer value meaning "return false to the caller".
pub const PTR_RETURN_FALSE: u8 = 254;
/// Pointer value meaning "return true to the caller".
pub const PTR_RETURN_TRUE: u8 = 255;

/// Largest instruction count a script can have while every index stays
/// distinguishable from the terminal sentinels.
pub const MAX_INSTRUCTIONS: usize = PTR_ERROR as usize;

pub const SLEEP: u16 = 0x00;
pub const GENERIC_CALL: u16 = 0x01;
pub const EXPRESSION: u16 = 0x02;
pub const FIND_BEST_INTERACTION: u16 = 0x03;
pub const IDLE_FOR_INPUT: u16 = 0x11;
pub const LOOK_TOWARDS: u16 = 0x16;
pub const GO_TO_RELATIVE: u16 = 0x1B;
pub const GOSUB: u16 = 0x1C;
pub const GOSUB_FOUND_ACTION: u16 = 0x1E;
pub const DIALOG: u16 = 0x24;
pub const ANIMATE_SIM: u16 = 0x2C;
pub const GO_TO_ROUTING_SLOT: u16 = 0x2D;
pub const REACH: u16 = 0x2F;

/// How the operand bytes of a primitive are laid out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandSchema {
    /// Comparison or assignment between two scoped variables.
    Expression,
    /// Explicit subroutine call: 16-bit target plus four parameter bytes.
    Call,
    /// No known structure; the eight bytes are kept as-is.
    Raw,
}

/// Control transfer shape of a primitive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrimitiveFlow {
    /// Always continues to the true pointer.
    Continue,
    /// Continues to the true or the false pointer depending on the outcome.
    Branch,
    /// Decided per instruction from the decoded operand.
    ByOperand,
}

/// Static description of one primitive.
#[derive(Clone, Copy, Debug)]
pub struct Primitive {
    pub opcode: u16,
    pub name: &'static str,
    pub schema: OperandSchema,
    pub flow: PrimitiveFlow,
    /// The primitive may suspend the script and resume it on a later tick.
    pub yields: bool,
    /// Net effect on the found-action stack.
    pub stack_effect: i8,
}

const fn prim(
    opcode: u16,
    name: &'static str,
    schema: OperandSchema,
    flow: PrimitiveFlow,
    yields: bool,
    stack_effect: i8,
) -> Primitive {
    Primitive {
        opcode,
        name,
        schema,
        flow,
        yields,
        stack_effect,
    }
}

use OperandSchema::{Call, Expression, Raw};
use PrimitiveFlow::{Branch, ByOperand, Continue};

/// Known primitives, sorted by opcode. Gaps are unassigned opcodes.
pub const PRIMITIVES: &[Primitive] = &[
    prim(SLEEP, "sleep", Raw, Continue, true, 0),
    prim(GENERIC_CALL, "generic call", Raw, Branch, false, 0),
    prim(EXPRESSION, "expression", Expression, ByOperand, false, 0),
    prim(FIND_BEST_INTERACTION, "find best interaction", Raw, Branch, false, 1),
    prim(0x04, "grab", Raw, Branch, false, 0),
    prim(0x05, "drop", Raw, Branch, false, 0),
    prim(0x06, "change suit", Raw, Continue, false, 0),
    prim(0x07, "refresh", Raw, Continue, false, 0),
    prim(0x08, "random number", Raw, Continue, false, 0),
    prim(0x09, "burn", Raw, Branch, false, 0),
    prim(0x0A, "tutorial", Raw, Continue, false, 0),
    prim(0x0B, "get distance to", Raw, Continue, false, 0),
    prim(0x0C, "get direction to", Raw, Continue, false, 0),
    prim(0x0D, "push interaction", Raw, Branch, false, 0),
    prim(0x0E, "find best object for function", Raw, Branch, false, 0),
    prim(0x0F, "breakpoint", Raw, Continue, false, 0),
    prim(0x10, "find location for", Raw, Branch, false, 0),
    prim(IDLE_FOR_INPUT, "idle for input", Raw, Branch, true, 0),
    prim(0x12, "remove object instance", Raw, Continue, false, 0),
    prim(0x13, "make new character", Raw, Continue, false, 0),
    prim(0x14, "run functional tree", Raw, Branch, false, 0),
    prim(0x15, "show string", Raw, Continue, false, 0),
    prim(LOOK_TOWARDS, "look towards", Raw, Branch, true, 0),
    prim(0x17, "play sound event", Raw, Continue, false, 0),
    prim(0x18, "old relationship", Raw, Branch, false, 0),
    prim(0x19, "alter budget", Raw, Branch, false, 0),
    prim(0x1A, "relationship", Raw, Branch, false, 0),
    prim(GO_TO_RELATIVE, "go to relative position", Raw, Branch, true, 0),
    prim(GOSUB, "gosub", Call, Branch, false, 0),
    prim(0x1D, "set motive change", Raw, Continue, false, 0),
    prim(GOSUB_FOUND_ACTION, "gosub found action", Raw, Branch, false, -1),
    prim(0x1F, "set to next", Raw, Branch, false, 0),
    prim(0x20, "test object type", Raw, Branch, false, 0),
    prim(0x21, "find 5 worst motives", Raw, Continue, false, 0),
    prim(0x22, "ui effect", Raw, Continue, false, 0),
    prim(0x23, "special effect", Raw, Continue, false, 0),
    prim(DIALOG, "dialog", Raw, Branch, true, 0),
    prim(0x25, "test sim interacting with", Raw, Branch, false, 0),
    prim(0x29, "set balloon", Raw, Continue, false, 0),
    prim(0x2A, "create object instance", Raw, Branch, false, 0),
    prim(0x2B, "drop onto", Raw, Branch, false, 0),
    prim(ANIMATE_SIM, "animate sim", Raw, Branch, true, 0),
    prim(GO_TO_ROUTING_SLOT, "go to routing slot", Raw, Branch, true, 0),
    prim(0x2E, "snap", Raw, Branch, false, 0),
    prim(REACH, "reach", Raw, Branch, true, 0),
    prim(0x30, "stop all sounds", Raw, Continue, false, 0),
    prim(0x31, "notify out of idle", Raw, Continue, false, 0),
    prim(0x32, "change action string", Raw, Continue, false, 0),
    prim(0x33, "manage inventory", Raw, Branch, false, 0),
];

/// Look up a primitive by opcode.
pub fn primitive(opcode: u16) -> Option<&'static Primitive> {
    PRIMITIVES
        .binary_search_by_key(&opcode, |p| p.opcode)
        .ok()
        .map(|index| &PRIMITIVES[index])
}

pub fn is_subroutine_call(opcode: u16) -> bool {
    opcode >= SUBROUTINE_THRESHOLD
}

/// Opcodes of primitives that can suspend execution.
pub fn yield_capable_opcodes() -> impl Iterator<Item = u16> {
    PRIMITIVES.iter().filter(|p| p.yields).map(|p| p.opcode)
}
