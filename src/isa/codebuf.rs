//! Code buffer for building routine bodies.
//!
//! Bytes are emitted little-endian; branches to labels that are not yet
//! defined are recorded and patched by `patch_forward_refs`.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CodeBufferError {
    #[error("undefined label: {0}")]
    UndefinedLabel(String),
    #[error("branch offset out of range for label: {0}")]
    OutOfRange(String),
}

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    /// Pending imm26 branch references (offset, label)
    forward_refs: Vec<(usize, String)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Emit a 32-bit instruction word.
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Define a label at the current position.
    pub fn define_label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.code.len());
    }

    /// Emit a B/BL style instruction whose imm26 field targets `label`.
    /// `opcode` carries the top six bits; the offset is filled in later.
    pub fn emit_branch_ref(&mut self, opcode: u32, label: &str) {
        self.forward_refs.push((self.code.len(), label.to_string()));
        self.emit_u32(opcode & 0xFC00_0000);
    }

    /// Patch all forward references.
    pub fn patch_forward_refs(&mut self) -> Result<(), CodeBufferError> {
        for (offset, label) in std::mem::take(&mut self.forward_refs) {
            let target = self
                .labels
                .get(&label)
                .ok_or_else(|| CodeBufferError::UndefinedLabel(label.clone()))?;

            // offset is in instructions (4-byte units)
            let rel = ((*target as i64) - (offset as i64)) / 4;
            if !(-(1 << 25)..(1 << 25)).contains(&rel) {
                return Err(CodeBufferError::OutOfRange(label));
            }
            let current = self.read_u32(offset);
            let inst = (current & 0xFC00_0000) | ((rel as u32) & 0x03FF_FFFF);
            self.code[offset..offset + 4].copy_from_slice(&inst.to_le_bytes());
        }
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.code[offset..offset + 4]);
        u32::from_le_bytes(word)
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer, patching forward references first.
    pub fn finish(mut self) -> Result<Vec<u8>, CodeBufferError> {
        self.patch_forward_refs()?;
        Ok(self.code)
    }
}
