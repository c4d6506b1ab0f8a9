//! Error types for decoding and corpus loading.
//!
//! Degraded input is not an error here: truncated buffers and unknown
//! opcodes come back as flagged results. These enums cover input that cannot
//! be interpreted at all.

use thiserror::Error;

/// Fatal decode failure for one script.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// More instructions declared than the 8-bit pointers can address.
    #[error("declared instruction count {declared} exceeds the addressable maximum of {max}")]
    TooManyInstructions { declared: usize, max: usize },
}

/// Failure to turn an input document into script images or evidence.
#[derive(Debug, Error)]
pub enum CorpusError {
    /// The document does not match its JSON schema.
    #[error("{document} does not match the expected schema: {details}")]
    SchemaViolation { document: String, details: String },

    /// Script code is not valid hex.
    #[error("script {id:#06x}: code is not valid hex")]
    InvalidHex {
        id: u16,
        #[source]
        source: hex::FromHexError,
    },

    /// Two scripts share one id.
    #[error("duplicate script id {id:#06x} (owners `{first}` and `{second}`)")]
    DuplicateScript {
        id: u16,
        first: String,
        second: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_names_both_counts() {
        let err = DecodeError::TooManyInstructions {
            declared: 300,
            max: 253,
        };
        let message = err.to_string();
        assert!(message.contains("300"));
        assert!(message.contains("253"));
    }

    #[test]
    fn duplicate_script_shows_hex_id() {
        let err = CorpusError::DuplicateScript {
            id: 0x1001,
            first: "chair".to_string(),
            second: "sofa".to_string(),
        };
        assert!(err.to_string().contains("0x1001"));
    }
}
