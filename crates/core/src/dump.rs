//! Binary dump/load of compiled chunks
//!
//! The on-disk form is a fixed signature, a format version byte, then the
//! bincode encoding of [`Chunk`]. Loading checks the header, decodes, and
//! runs full structural validation, so a loaded chunk is safe for the
//! dispatch loop to trust.
//!
//! Uses bincode for fast, compact binary serialization, with the chunk types
//! deriving serde. Corruption anywhere (header, body, or operands) surfaces
//! as a [`DumpError`], never as a panic.

use crate::chunk::{Chunk, ChunkError};
use std::fmt;

/// Leading bytes of every dumped chunk. The escape byte keeps text tools
/// from mistaking a dump for source.
pub const SIGNATURE: &[u8; 5] = b"\x1bRill";

/// Bumped on any incompatible change to the chunk encoding.
pub const FORMAT_VERSION: u8 = 2;

/// Error during chunk dump/load.
#[derive(Debug)]
pub enum DumpError {
    /// Input does not start with the chunk signature.
    BadSignature,
    /// Signature matched but the format version is not ours.
    BadVersion(u8),
    /// Bincode encoding/decoding error (preserves the original error).
    Encoding(Box<bincode::Error>),
    /// Decoded structure failed validation.
    Invalid(ChunkError),
}

impl fmt::Display for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpError::BadSignature => write!(f, "not a compiled chunk (bad signature)"),
            DumpError::BadVersion(v) => {
                write!(f, "unsupported chunk format version {v} (expected {FORMAT_VERSION})")
            }
            DumpError::Encoding(e) => write!(f, "chunk encoding error: {e}"),
            DumpError::Invalid(e) => write!(f, "malformed chunk: {e}"),
        }
    }
}

impl std::error::Error for DumpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DumpError::Encoding(e) => Some(e),
            DumpError::Invalid(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bincode::Error> for DumpError {
    fn from(e: bincode::Error) -> Self {
        DumpError::Encoding(Box::new(e))
    }
}

impl From<ChunkError> for DumpError {
    fn from(e: ChunkError) -> Self {
        DumpError::Invalid(e)
    }
}

/// Serialize a chunk to its binary form.
pub fn dump_chunk(chunk: &Chunk) -> Result<Vec<u8>, DumpError> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(SIGNATURE);
    out.push(FORMAT_VERSION);
    let body = bincode::serialize(chunk)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize and validate a chunk from its binary form.
pub fn load_chunk(bytes: &[u8]) -> Result<Chunk, DumpError> {
    let Some(rest) = bytes.strip_prefix(SIGNATURE.as_slice()) else {
        return Err(DumpError::BadSignature);
    };
    let (&version, body) = rest.split_first().ok_or(DumpError::BadSignature)?;
    if version != FORMAT_VERSION {
        return Err(DumpError::BadVersion(version));
    }
    let chunk: Chunk = bincode::deserialize(body)?;
    chunk.validate()?;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Constant, Instruction, OpCode, Proto};

    fn sample_chunk() -> Chunk {
        Chunk {
            protos: vec![Proto {
                max_stack: 3,
                constants: vec![Constant::Number(42.0), Constant::Str("answer".into())],
                code: vec![
                    Instruction::abx(OpCode::LoadK, 0, 0),
                    Instruction::abc(OpCode::Return, 0, 2, 0),
                ],
                source: Some("sample".into()),
                line_info: vec![1, 1],
                ..Proto::default()
            }],
            main: 0,
        }
    }

    #[test]
    fn test_roundtrip() {
        let chunk = sample_chunk();
        let bytes = dump_chunk(&chunk).expect("dump");
        let back = load_chunk(&bytes).expect("load");
        assert_eq!(chunk, back);
    }

    #[test]
    fn test_rejects_bad_signature() {
        assert!(matches!(load_chunk(b"plain text"), Err(DumpError::BadSignature)));
        assert!(matches!(load_chunk(b""), Err(DumpError::BadSignature)));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut bytes = dump_chunk(&sample_chunk()).expect("dump");
        bytes[SIGNATURE.len()] = FORMAT_VERSION + 1;
        assert!(matches!(load_chunk(&bytes), Err(DumpError::BadVersion(_))));
    }

    #[test]
    fn test_rejects_truncated_body() {
        let bytes = dump_chunk(&sample_chunk()).expect("dump");
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(load_chunk(cut), Err(DumpError::Encoding(_))));
    }

    #[test]
    fn test_rejects_out_of_range_operand() {
        // Hand-corrupt a decoded chunk, re-dump, and confirm load catches it.
        let mut chunk = sample_chunk();
        chunk.protos[0].code[0] = Instruction::abx(OpCode::LoadK, 0, 99);
        let bytes = dump_chunk(&chunk).expect("dump");
        assert!(matches!(load_chunk(&bytes), Err(DumpError::Invalid(_))));
    }

    #[test]
    fn test_roundtrip_through_file() {
        use std::io::{Read, Seek, Write};

        let chunk = sample_chunk();
        let bytes = dump_chunk(&chunk).expect("dump");

        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(&bytes).expect("write");
        file.rewind().expect("rewind");

        let mut back = Vec::new();
        file.read_to_end(&mut back).expect("read");
        assert_eq!(load_chunk(&back).expect("load"), chunk);
    }
}
