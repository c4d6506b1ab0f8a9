//! Instruction decoding from the flat record buffer.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::ir::Instruction;
use crate::opcodes::{self, INSTRUCTION_SIZE, MAX_INSTRUCTIONS};
use crate::operand::decode_operand;

/// One script as handed over by the container reader.
#[derive(Clone, Debug)]
pub struct ScriptImage {
    pub id: u16,
    /// Object or group the script belongs to.
    pub owner: String,
    pub arg_count: u8,
    pub local_count: u8,
    pub instruction_count: usize,
    pub code: Vec<u8>,
}

/// Why a decode stopped early.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PartialReason {
    Truncated {
        needed_bytes: usize,
        available_bytes: usize,
    },
}

/// Quality of a decode.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DecodeStatus {
    Complete,
    Partial(PartialReason),
}

/// Instructions recovered from a buffer plus what went wrong on the way.
#[derive(Clone, Debug, Serialize)]
pub struct Decoded {
    pub instructions: Vec<Instruction>,
    pub declared_count: usize,
    pub status: DecodeStatus,
}

impl Decoded {
    pub fn is_truncated(&self) -> bool {
        matches!(
            self.status,
            DecodeStatus::Partial(PartialReason::Truncated { .. })
        )
    }

    pub fn unknown_opcode_count(&self) -> usize {
        self.instructions.iter().filter(|inst| inst.unknown).count()
    }

    pub fn operand_issue_count(&self) -> usize {
        self.instructions.iter().map(|inst| inst.issues.len()).sum()
    }
}

/// Decode `declared_count` instruction records from `code`.
///
/// A short buffer yields the records that fit and a `Partial` status. Only a
/// declared count the pointers cannot address is fatal.
pub fn decode(code: &[u8], declared_count: usize) -> Result<Decoded, DecodeError> {
    if declared_count > MAX_INSTRUCTIONS {
        return Err(DecodeError::TooManyInstructions {
            declared: declared_count,
            max: MAX_INSTRUCTIONS,
        });
    }

    let mut instructions = Vec::with_capacity(declared_count);
    let mut status = DecodeStatus::Complete;
    for (index, record) in code.chunks(INSTRUCTION_SIZE).take(declared_count).enumerate() {
        let Ok(record) = <&[u8; INSTRUCTION_SIZE]>::try_from(record) else {
            break;
        };
        instructions.push(decode_record(index, record));
    }

    if instructions.len() < declared_count {
        let reason = PartialReason::Truncated {
            needed_bytes: declared_count * INSTRUCTION_SIZE,
            available_bytes: code.len(),
        };
        warn!(
            decoded = instructions.len(),
            declared = declared_count,
            available_bytes = code.len(),
            "instruction buffer truncated"
        );
        status = DecodeStatus::Partial(reason);
    } else if code.len() > declared_count * INSTRUCTION_SIZE {
        debug!(
            trailing = code.len() - declared_count * INSTRUCTION_SIZE,
            "ignoring bytes past the declared instructions"
        );
    }

    Ok(Decoded {
        instructions,
        declared_count,
        status,
    })
}

pub fn decode_image(image: &ScriptImage) -> Result<Decoded, DecodeError> {
    decode(&image.code, image.instruction_count)
}

fn decode_record(index: usize, record: &[u8; INSTRUCTION_SIZE]) -> Instruction {
    let opcode = u16::from_le_bytes([record[0], record[1]]);
    let mut raw_operand = [0u8; 8];
    raw_operand.copy_from_slice(&record[4..]);
    let decoded = decode_operand(opcode, raw_operand);
    let unknown = !opcodes::is_subroutine_call(opcode) && opcodes::primitive(opcode).is_none();
    if unknown {
        debug!(index, opcode, "unknown primitive opcode");
    }

    Instruction {
        index,
        opcode,
        true_pointer: record[2],
        false_pointer: record[3],
        raw_operand,
        operand: decoded.operand,
        unknown,
        issues: decoded.issues,
    }
}

/// Encode one instruction record. Test fixtures and the demo corpus use
/// this to build buffers.
pub fn encode_record(
    opcode: u16,
    true_pointer: u8,
    false_pointer: u8,
    operand: [u8; 8],
) -> [u8; INSTRUCTION_SIZE] {
    let mut record = [0u8; INSTRUCTION_SIZE];
    record[..2].copy_from_slice(&opcode.to_le_bytes());
    record[2] = true_pointer;
    record[3] = false_pointer;
    record[4..].copy_from_slice(&operand);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::PointerTarget;
    use crate::opcodes::{EXPRESSION, PTR_RETURN_FALSE, PTR_RETURN_TRUE, SLEEP};

    fn buffer(records: &[[u8; 12]]) -> Vec<u8> {
        records.iter().flatten().copied().collect()
    }

    #[test]
    fn decodes_complete_buffer() {
        let code = buffer(&[
            encode_record(SLEEP, 1, PTR_RETURN_FALSE, [0; 8]),
            encode_record(0x1001, PTR_RETURN_TRUE, PTR_RETURN_FALSE, [0; 8]),
        ]);
        let decoded = decode(&code, 2).expect("decode");

        assert_eq!(DecodeStatus::Complete, decoded.status);
        assert_eq!(2, decoded.instructions.len());
        assert_eq!(Some(0x1001), decoded.instructions[1].call_target());
        assert_eq!(0, decoded.unknown_opcode_count());
    }

    #[test]
    fn truncated_buffer_yields_prefix_and_flag() {
        for count in 1..=6usize {
            let records: Vec<[u8; 12]> = (0..count)
                .map(|i| encode_record(SLEEP, (i + 1) as u8, PTR_RETURN_FALSE, [0; 8]))
                .collect();
            let mut code = buffer(&records);
            code.pop();

            let decoded = decode(&code, count).expect("partial decode is not an error");

            assert_eq!(count - 1, decoded.instructions.len());
            assert!(decoded.is_truncated());
        }
    }

    #[test]
    fn empty_buffer_is_partial_not_fatal() {
        let decoded = decode(&[], 3).expect("decode");
        assert!(decoded.instructions.is_empty());
        assert_eq!(
            DecodeStatus::Partial(PartialReason::Truncated {
                needed_bytes: 36,
                available_bytes: 0
            }),
            decoded.status
        );
    }

    #[test]
    fn oversized_count_is_fatal() {
        let result = decode(&[], MAX_INSTRUCTIONS + 1);
        assert!(matches!(
            result,
            Err(DecodeError::TooManyInstructions { declared: 254, .. })
        ));
    }

    #[test]
    fn unknown_primitive_is_flagged_not_rejected() {
        let code = buffer(&[encode_record(0x00EE, PTR_RETURN_TRUE, PTR_RETURN_FALSE, [7; 8])]);
        let decoded = decode(&code, 1).expect("decode");
        assert!(decoded.instructions[0].unknown);
        assert_eq!(1, decoded.unknown_opcode_count());
    }

    #[test]
    fn every_pointer_resolves_to_index_sentinel_or_invalid() {
        for count in [1usize, 2, 17, 128, 252, 253] {
            for pointer in 0..=u8::MAX {
                let code = buffer(&[encode_record(EXPRESSION, pointer, pointer, [0; 8])]);
                let decoded = decode(&code, 1).expect("decode");
                let inst = &decoded.instructions[0];
                match inst.true_target(count) {
                    PointerTarget::Instruction(index) => assert!(index < count),
                    PointerTarget::Terminal(_) => assert!(pointer >= 253),
                    PointerTarget::Invalid(raw) => {
                        assert!((raw as usize) >= count && raw < 253)
                    }
                }
                assert_eq!(inst.true_target(count), inst.false_target(count));
            }
        }
    }
}
