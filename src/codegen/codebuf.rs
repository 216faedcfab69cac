//! Code buffer for building one codelet.
//!
//! A buffer knows the absolute address its first byte will occupy once it
//! is committed to a code region, so that references to code outside the
//! codelet (runtime entries, other codelets) can be encoded as relative
//! displacements up front. References to labels inside the codelet are
//! recorded and patched by `patch_forward_refs`.

use super::masm::Label;

/// A buffer for building machine code.
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Address the buffer will be copied to.
    base: usize,
    /// Bound offsets, indexed by label id.
    labels: Vec<Option<usize>>,
    /// Pending references (offset of the rel32 field, label, end of instruction).
    forward_refs: Vec<(usize, Label, usize)>,
}

impl CodeBuffer {
    /// Create an empty buffer whose code will live at `base`.
    pub fn new(base: usize) -> Self {
        Self {
            code: Vec::with_capacity(256),
            base,
            labels: Vec::new(),
            forward_refs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current offset from the start of the buffer.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Absolute address of the next emitted byte.
    pub fn pc(&self) -> usize {
        self.base + self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current position.
    pub fn bind_label(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    /// Absolute address of a bound label.
    pub fn label_address(&self, label: Label) -> Option<usize> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .map(|off| self.base + off)
    }

    /// Emit a rel32 placeholder referring to `label`.
    ///
    /// `trailing` is the number of instruction bytes that follow the
    /// displacement; the displacement is relative to the end of the
    /// instruction.
    pub fn emit_label_rel32(&mut self, label: Label, trailing: usize) {
        let offset = self.code.len();
        self.forward_refs.push((offset, label, offset + 4 + trailing));
        self.emit_u32(0);
    }

    /// Emit a rel32 displacement to an absolute address, relative to the
    /// end of the displacement field plus `trailing` bytes.
    pub fn emit_abs_rel32(&mut self, target: usize, trailing: usize) -> Result<(), String> {
        let end = self.pc() as i64 + 4 + trailing as i64;
        let rel = target as i64 - end;
        if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
            return Err(format!("target {:#x} out of rel32 range", target));
        }
        self.emit_i32(rel as i32);
        Ok(())
    }

    /// Patch all forward references.
    /// Returns an error if any label is unbound.
    pub fn patch_forward_refs(&mut self) -> Result<(), String> {
        for (offset, label, end) in self.forward_refs.drain(..) {
            let target = self.labels[label.0].ok_or_else(|| format!("unbound label: {}", label.0))?;
            let rel_offset = target as i64 - end as i64;
            if rel_offset < i32::MIN as i64 || rel_offset > i32::MAX as i64 {
                return Err(format!("relative offset out of range for label: {}", label.0));
            }
            self.code[offset..offset + 4].copy_from_slice(&(rel_offset as i32).to_le_bytes());
        }
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Patch forward references and return the bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, String> {
        self.patch_forward_refs()?;
        Ok(self.code)
    }

    /// Pad with `fill` up to the given alignment of the absolute address.
    pub fn align(&mut self, alignment: usize, fill: u8) {
        while self.pc() % alignment != 0 {
            self.emit_u8(fill);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new(0x1000);
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 7);
        assert_eq!(buf.pc(), 0x1007);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_forward_label_patch() {
        let mut buf = CodeBuffer::new(0);
        let l = buf.create_label();
        buf.emit_u8(0xE9);
        buf.emit_label_rel32(l, 0);
        buf.emit_u8(0x90);
        buf.bind_label(l);
        assert_eq!(buf.label_address(l), Some(6));
        let code = buf.finish().unwrap();
        assert_eq!(&code[1..5], &1i32.to_le_bytes());
    }

    #[test]
    fn test_unbound_label_is_error() {
        let mut buf = CodeBuffer::new(0);
        let l = buf.create_label();
        buf.emit_label_rel32(l, 0);
        assert!(buf.finish().is_err());
    }

    #[test]
    fn test_absolute_target() {
        let mut buf = CodeBuffer::new(0x2000);
        buf.emit_u8(0xE8);
        buf.emit_abs_rel32(0x1000, 0).unwrap();
        assert_eq!(&buf.code()[1..5], &(0x1000i32 - 0x2005).to_le_bytes());
    }

    #[test]
    fn test_alignment() {
        let mut buf = CodeBuffer::new(0x1001);
        buf.emit_u8(0x90);
        buf.align(4, 0);
        assert_eq!(buf.pc() % 4, 0);
        assert_eq!(buf.len(), 3);
    }
}
