use gimli::{EvaluationResult, Location, Value};

use crate::dwarf::Slice;

/// The capabilities a location expression may demand from the tracee.
pub trait ExprContext {
    fn reg(&self, dwarf_id: u16) -> Result<u64, String>;
    fn pc(&self) -> Result<u64, String>;
    /// Reads `size` bytes at `addr`, zero-extended to a word.
    fn deref_size(&self, addr: u64, size: u8) -> Result<u64, String>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExprValue {
    /// The variable lives at this tracee address.
    Address(u64),
    /// The variable lives in this DWARF register.
    Register(u16),
    /// The expression computed the value itself.
    Literal(u64),
}

/// Runs a DW_AT_location expression to completion, resolving register,
/// memory and frame-base demands through `ctx`. `frame_base` is the
/// enclosing subprogram's DW_AT_frame_base expression.
pub fn evaluate(
    expression: &gimli::Expression<Slice>,
    encoding: gimli::Encoding,
    frame_base: Option<&gimli::Expression<Slice>>,
    ctx: &dyn ExprContext,
) -> Result<ExprValue, String> {
    let mut eval = expression.clone().evaluation(encoding);
    let mut state = eval
        .evaluate()
        .map_err(|e| format!("failed to start location evaluation: {}", e))?;

    loop {
        match state {
            EvaluationResult::Complete => break,

            EvaluationResult::RequiresRegister { register, .. } => {
                let value = ctx.reg(register.0)?;
                state = eval
                    .resume_with_register(Value::Generic(value))
                    .map_err(|e| format!("failed to resume with register: {}", e))?;
            }

            EvaluationResult::RequiresMemory { address, size, .. } => {
                let value = ctx.deref_size(address, size)?;
                state = eval
                    .resume_with_memory(Value::Generic(value))
                    .map_err(|e| format!("failed to resume with memory: {}", e))?;
            }

            EvaluationResult::RequiresFrameBase => {
                let base_expression = frame_base
                    .ok_or("location expression needs a frame base but the function has none")?;
                let base = match evaluate(base_expression, encoding, None, ctx)? {
                    ExprValue::Address(addr) => addr,
                    // frame base in a register means the register's contents
                    ExprValue::Register(id) => ctx.reg(id)?,
                    ExprValue::Literal(value) => value,
                };
                state = eval
                    .resume_with_frame_base(base)
                    .map_err(|e| format!("failed to resume with frame base: {}", e))?;
            }

            EvaluationResult::RequiresCallFrameCfa => {
                // the tracee is compiled with frame pointers: the CFA sits
                // two words above the saved rbp
                let rbp = ctx.reg(6)?;
                state = eval
                    .resume_with_call_frame_cfa(rbp + 16)
                    .map_err(|e| format!("failed to resume with cfa: {}", e))?;
            }

            EvaluationResult::RequiresRelocatedAddress(addr) => {
                // non-relocated executables: addresses are already absolute
                state = eval
                    .resume_with_relocated_address(addr)
                    .map_err(|e| format!("failed to resume with address: {}", e))?;
            }

            _ => {
                return Err(format!(
                    "unhandled location operation near pc {:#x}",
                    ctx.pc()?
                ))
            }
        }
    }

    let pieces = eval.result();
    if pieces.len() != 1 || pieces[0].bit_offset.is_some() {
        return Err("unhandled composite variable location".to_owned());
    }

    match pieces[0].location {
        Location::Address { address } => Ok(ExprValue::Address(address)),
        Location::Register { register } => Ok(ExprValue::Register(register.0)),
        Location::Value { value } => Ok(ExprValue::Literal(generic_value(value)?)),
        _ => Err("unhandled variable location".to_owned()),
    }
}

fn generic_value(value: Value) -> Result<u64, String> {
    match value {
        Value::Generic(v) => Ok(v),
        Value::U64(v) => Ok(v),
        Value::I64(v) => Ok(v as u64),
        Value::U32(v) => Ok(v as u64),
        Value::I32(v) => Ok(v as u64),
        _ => Err("unhandled typed location value".to_owned()),
    }
}

/// Masks a full-word read down to the low `size` bytes.
pub fn mask_to_size(word: u64, size: u8) -> u64 {
    if size >= 8 {
        word
    } else {
        word & ((1u64 << (u64::from(size) * 8)) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedContext {
        regs: Vec<(u16, u64)>,
        memory_word: u64,
    }

    impl ExprContext for FixedContext {
        fn reg(&self, dwarf_id: u16) -> Result<u64, String> {
            self.regs
                .iter()
                .find(|(id, _)| *id == dwarf_id)
                .map(|(_, value)| *value)
                .ok_or_else(|| format!("unknown DWARF register number: {}", dwarf_id))
        }

        fn pc(&self) -> Result<u64, String> {
            Ok(0x401000)
        }

        fn deref_size(&self, _addr: u64, size: u8) -> Result<u64, String> {
            Ok(mask_to_size(self.memory_word, size))
        }
    }

    fn encoding() -> gimli::Encoding {
        gimli::Encoding {
            format: gimli::Format::Dwarf32,
            version: 4,
            address_size: 8,
        }
    }

    fn expression(bytes: &'static [u8]) -> gimli::Expression<Slice> {
        gimli::Expression(gimli::EndianSlice::new(bytes, gimli::RunTimeEndian::Little))
    }

    fn no_regs() -> FixedContext {
        FixedContext { regs: Vec::new(), memory_word: 0 }
    }

    #[test]
    fn op_addr_names_a_memory_location() {
        // DW_OP_addr 0x1000
        let expr = expression(&[0x03, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let result = evaluate(&expr, encoding(), None, &no_regs()).unwrap();
        assert_eq!(result, ExprValue::Address(0x1000));
    }

    #[test]
    fn op_reg_names_a_register_location() {
        // DW_OP_reg0
        let expr = expression(&[0x50]);
        let result = evaluate(&expr, encoding(), None, &no_regs()).unwrap();
        assert_eq!(result, ExprValue::Register(0));
    }

    #[test]
    fn op_breg_offsets_a_register() {
        // DW_OP_breg7 +8
        let expr = expression(&[0x77, 0x08]);
        let ctx = FixedContext { regs: vec![(7, 0x7fff0000)], memory_word: 0 };
        let result = evaluate(&expr, encoding(), None, &ctx).unwrap();
        assert_eq!(result, ExprValue::Address(0x7fff0008));
    }

    #[test]
    fn op_fbreg_resolves_through_the_frame_base() {
        // DW_OP_fbreg -16, frame base DW_OP_reg6
        let expr = expression(&[0x91, 0x70]);
        let frame_base = expression(&[0x56]);
        let ctx = FixedContext { regs: vec![(6, 0x7fff0100)], memory_word: 0 };
        let result = evaluate(&expr, encoding(), Some(&frame_base), &ctx).unwrap();
        assert_eq!(result, ExprValue::Address(0x7fff0100 - 16));
    }

    #[test]
    fn op_fbreg_resolves_through_the_call_frame_cfa() {
        // DW_OP_fbreg +0, frame base DW_OP_call_frame_cfa
        let expr = expression(&[0x91, 0x00]);
        let frame_base = expression(&[0x9c]);
        let ctx = FixedContext { regs: vec![(6, 0x7fff0200)], memory_word: 0 };
        let result = evaluate(&expr, encoding(), Some(&frame_base), &ctx).unwrap();
        assert_eq!(result, ExprValue::Address(0x7fff0200 + 16));
    }

    #[test]
    fn fbreg_without_a_frame_base_fails() {
        let expr = expression(&[0x91, 0x00]);
        assert!(evaluate(&expr, encoding(), None, &no_regs()).is_err());
    }

    #[test]
    fn literal_stack_value() {
        // DW_OP_lit5 DW_OP_stack_value
        let expr = expression(&[0x35, 0x9f]);
        let result = evaluate(&expr, encoding(), None, &no_regs()).unwrap();
        assert_eq!(result, ExprValue::Literal(5));
    }

    #[test]
    fn deref_reads_through_the_context() {
        // DW_OP_breg7 +0, DW_OP_deref, DW_OP_stack_value
        let expr = expression(&[0x77, 0x00, 0x06, 0x9f]);
        let ctx = FixedContext { regs: vec![(7, 0x7fff0000)], memory_word: 0xDEADBEEF };
        let result = evaluate(&expr, encoding(), None, &ctx).unwrap();
        assert_eq!(result, ExprValue::Literal(0xDEADBEEF));
    }

    #[test]
    fn mask_covers_the_common_widths() {
        let word = 0x1122334455667788u64;
        assert_eq!(mask_to_size(word, 1), 0x88);
        assert_eq!(mask_to_size(word, 2), 0x7788);
        assert_eq!(mask_to_size(word, 4), 0x55667788);
        assert_eq!(mask_to_size(word, 8), word);
    }
}
