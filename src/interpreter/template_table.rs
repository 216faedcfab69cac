//! The template table: for every bytecode, the top-of-stack state it
//! expects and leaves, a few flags, and the generator of its body.

use crate::codegen::masm::{AluOp, Cond, FloatOp, NanOrder, Precision};
use crate::vm::oop::BasicType;

use super::bytecodes::{self as bc, NUMBER_OF_CODES};
use super::tos::TosState;

pub mod flags {
    /// The body ends in its own dispatch (branches, returns, invokes).
    pub const DOES_DISPATCH: u8 = 1 << 0;
    /// The body may call into the VM.
    pub const CALLS_VM: u8 = 1 << 1;
}

/// What a template body does. Bodies are emitted by
/// [`templates::generate`](super::templates::generate).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gen {
    Nop,
    AconstNull,
    Iconst(i32),
    Lconst(i64),
    Fconst(f32),
    Dconst(f64),
    Bipush,
    Sipush,
    Ldc { wide: bool },
    Ldc2W,
    Load { state: TosState, wide: bool },
    LoadN { state: TosState, index: usize },
    ArrayLoad(BasicType),
    Store { state: TosState, wide: bool },
    StoreN { state: TosState, index: usize },
    ArrayStore(BasicType),
    Aastore,
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    Iop(AluOp),
    Lop(AluOp),
    Lshift(AluOp),
    Fop(FloatOp, Precision),
    Frem(Precision),
    Ineg,
    Lneg,
    Fneg(Precision),
    Iinc { wide: bool },
    Convert(u8),
    Lcmp,
    Fcmp(Precision, NanOrder),
    IfZero(Cond),
    IfIcmp(Cond),
    IfAcmp(Cond),
    IfNull(Cond),
    Goto { wide: bool },
    Tableswitch,
    Lookupswitch,
    Return(TosState),
    ReturnRegisterFinalizer,
    Field { is_static: bool, is_put: bool },
    Invoke(u8),
    New,
    Newarray,
    Anewarray,
    Multianewarray,
    Arraylength,
    Athrow,
    Checkcast,
    Instanceof,
    Monitorenter,
    Monitorexit,
    Wide,
    Unimplemented,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Template {
    pub flags: u8,
    pub tos_in: TosState,
    pub tos_out: TosState,
    pub body: Gen,
}

impl Template {
    pub fn does_dispatch(&self) -> bool {
        self.flags & flags::DOES_DISPATCH != 0
    }

    pub fn calls_vm(&self) -> bool {
        self.flags & flags::CALLS_VM != 0
    }

    pub fn is_unimplemented(&self) -> bool {
        self.body == Gen::Unimplemented
    }
}

pub struct TemplateTable {
    normal: [Option<Template>; NUMBER_OF_CODES],
    wide: [Option<Template>; NUMBER_OF_CODES],
}

impl Default for TemplateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateTable {
    pub fn new() -> Self {
        let mut table = TemplateTable {
            normal: [None; NUMBER_OF_CODES],
            wide: [None; NUMBER_OF_CODES],
        };
        table.initialize();
        table
    }

    pub fn template(&self, code: u8) -> Option<&Template> {
        self.normal[code as usize].as_ref()
    }

    /// Template for `code` following a `wide` prefix.
    pub fn wide_template(&self, code: u8) -> Option<&Template> {
        self.wide[code as usize].as_ref()
    }

    fn def(&mut self, code: u8, flags: u8, tos_in: TosState, tos_out: TosState, body: Gen) {
        debug_assert!(bc::is_defined(code), "template for undefined opcode {:#x}", code);
        self.normal[code as usize] = Some(Template {
            flags,
            tos_in,
            tos_out,
            body,
        });
    }

    fn def_wide(&mut self, code: u8, tos_in: TosState, tos_out: TosState, body: Gen) {
        self.wide[code as usize] = Some(Template {
            flags: 0,
            tos_in,
            tos_out,
            body,
        });
    }

    fn initialize(&mut self) {
        use TosState::*;
        use flags::{CALLS_VM as VM, DOES_DISPATCH as DISP};

        self.def(bc::NOP, 0, Vtos, Vtos, Gen::Nop);
        self.def(bc::ACONST_NULL, 0, Vtos, Atos, Gen::AconstNull);
        for (i, code) in (bc::ICONST_M1..=bc::ICONST_5).enumerate() {
            self.def(code, 0, Vtos, Itos, Gen::Iconst(i as i32 - 1));
        }
        self.def(bc::LCONST_0, 0, Vtos, Ltos, Gen::Lconst(0));
        self.def(bc::LCONST_1, 0, Vtos, Ltos, Gen::Lconst(1));
        self.def(bc::FCONST_0, 0, Vtos, Ftos, Gen::Fconst(0.0));
        self.def(bc::FCONST_1, 0, Vtos, Ftos, Gen::Fconst(1.0));
        self.def(bc::FCONST_2, 0, Vtos, Ftos, Gen::Fconst(2.0));
        self.def(bc::DCONST_0, 0, Vtos, Dtos, Gen::Dconst(0.0));
        self.def(bc::DCONST_1, 0, Vtos, Dtos, Gen::Dconst(1.0));
        self.def(bc::BIPUSH, 0, Vtos, Itos, Gen::Bipush);
        self.def(bc::SIPUSH, 0, Vtos, Itos, Gen::Sipush);
        self.def(bc::LDC, VM, Vtos, Vtos, Gen::Ldc { wide: false });
        self.def(bc::LDC_W, VM, Vtos, Vtos, Gen::Ldc { wide: true });
        self.def(bc::LDC2_W, 0, Vtos, Vtos, Gen::Ldc2W);

        let typed = [
            (Itos, bc::ILOAD, bc::ILOAD_0, bc::ISTORE, bc::ISTORE_0),
            (Ltos, bc::LLOAD, bc::LLOAD_0, bc::LSTORE, bc::LSTORE_0),
            (Ftos, bc::FLOAD, bc::FLOAD_0, bc::FSTORE, bc::FSTORE_0),
            (Dtos, bc::DLOAD, bc::DLOAD_0, bc::DSTORE, bc::DSTORE_0),
            (Atos, bc::ALOAD, bc::ALOAD_0, bc::ASTORE, bc::ASTORE_0),
        ];
        for (state, load, load_0, store, store_0) in typed {
            self.def(load, 0, Vtos, state, Gen::Load { state, wide: false });
            self.def(store, 0, state, Vtos, Gen::Store { state, wide: false });
            self.def_wide(load, Vtos, state, Gen::Load { state, wide: true });
            self.def_wide(store, state, Vtos, Gen::Store { state, wide: true });
            for index in 0..4 {
                self.def(load_0 + index as u8, 0, Vtos, state, Gen::LoadN { state, index });
                self.def(store_0 + index as u8, 0, state, Vtos, Gen::StoreN { state, index });
            }
        }

        let arrays = [
            (bc::IALOAD, bc::IASTORE, BasicType::Int),
            (bc::LALOAD, bc::LASTORE, BasicType::Long),
            (bc::FALOAD, bc::FASTORE, BasicType::Float),
            (bc::DALOAD, bc::DASTORE, BasicType::Double),
            (bc::AALOAD, bc::AASTORE, BasicType::Object),
            (bc::BALOAD, bc::BASTORE, BasicType::Byte),
            (bc::CALOAD, bc::CASTORE, BasicType::Char),
            (bc::SALOAD, bc::SASTORE, BasicType::Short),
        ];
        for (load, store, elem) in arrays {
            let state = match elem.tos_state() {
                Btos | Ztos | Ctos | Stos => Itos,
                s => s,
            };
            self.def(load, 0, Itos, state, Gen::ArrayLoad(elem));
            if elem == BasicType::Object {
                self.def(store, VM, Vtos, Vtos, Gen::Aastore);
            } else {
                self.def(store, 0, state, Vtos, Gen::ArrayStore(elem));
            }
        }

        self.def(bc::POP, 0, Vtos, Vtos, Gen::Pop);
        self.def(bc::POP2, 0, Vtos, Vtos, Gen::Pop2);
        self.def(bc::DUP, 0, Vtos, Vtos, Gen::Dup);
        self.def(bc::DUP_X1, 0, Vtos, Vtos, Gen::DupX1);
        self.def(bc::DUP_X2, 0, Vtos, Vtos, Gen::DupX2);
        self.def(bc::DUP2, 0, Vtos, Vtos, Gen::Dup2);
        self.def(bc::DUP2_X1, 0, Vtos, Vtos, Gen::Dup2X1);
        self.def(bc::DUP2_X2, 0, Vtos, Vtos, Gen::Dup2X2);
        self.def(bc::SWAP, 0, Vtos, Vtos, Gen::Swap);

        let int_ops = [
            (bc::IADD, bc::LADD, AluOp::Add),
            (bc::ISUB, bc::LSUB, AluOp::Sub),
            (bc::IMUL, bc::LMUL, AluOp::Mul),
            (bc::IDIV, bc::LDIV, AluOp::Div),
            (bc::IREM, bc::LREM, AluOp::Rem),
            (bc::IAND, bc::LAND, AluOp::And),
            (bc::IOR, bc::LOR, AluOp::Or),
            (bc::IXOR, bc::LXOR, AluOp::Xor),
        ];
        for (i, l, op) in int_ops {
            self.def(i, 0, Itos, Itos, Gen::Iop(op));
            self.def(l, 0, Ltos, Ltos, Gen::Lop(op));
        }
        let shifts = [
            (bc::ISHL, bc::LSHL, AluOp::Shl),
            (bc::ISHR, bc::LSHR, AluOp::Shr),
            (bc::IUSHR, bc::LUSHR, AluOp::Ushr),
        ];
        for (i, l, op) in shifts {
            self.def(i, 0, Itos, Itos, Gen::Iop(op));
            self.def(l, 0, Itos, Ltos, Gen::Lshift(op));
        }
        let float_ops = [
            (bc::FADD, bc::DADD, FloatOp::Add),
            (bc::FSUB, bc::DSUB, FloatOp::Sub),
            (bc::FMUL, bc::DMUL, FloatOp::Mul),
            (bc::FDIV, bc::DDIV, FloatOp::Div),
        ];
        for (f, d, op) in float_ops {
            self.def(f, 0, Ftos, Ftos, Gen::Fop(op, Precision::Single));
            self.def(d, 0, Dtos, Dtos, Gen::Fop(op, Precision::Double));
        }
        self.def(bc::FREM, 0, Ftos, Ftos, Gen::Frem(Precision::Single));
        self.def(bc::DREM, 0, Dtos, Dtos, Gen::Frem(Precision::Double));
        self.def(bc::INEG, 0, Itos, Itos, Gen::Ineg);
        self.def(bc::LNEG, 0, Ltos, Ltos, Gen::Lneg);
        self.def(bc::FNEG, 0, Ftos, Ftos, Gen::Fneg(Precision::Single));
        self.def(bc::DNEG, 0, Dtos, Dtos, Gen::Fneg(Precision::Double));
        self.def(bc::IINC, 0, Vtos, Vtos, Gen::Iinc { wide: false });
        self.def_wide(bc::IINC, Vtos, Vtos, Gen::Iinc { wide: true });

        let conversions = [
            (bc::I2L, Itos, Ltos),
            (bc::I2F, Itos, Ftos),
            (bc::I2D, Itos, Dtos),
            (bc::L2I, Ltos, Itos),
            (bc::L2F, Ltos, Ftos),
            (bc::L2D, Ltos, Dtos),
            (bc::F2I, Ftos, Itos),
            (bc::F2L, Ftos, Ltos),
            (bc::F2D, Ftos, Dtos),
            (bc::D2I, Dtos, Itos),
            (bc::D2L, Dtos, Ltos),
            (bc::D2F, Dtos, Ftos),
            (bc::I2B, Itos, Itos),
            (bc::I2C, Itos, Itos),
            (bc::I2S, Itos, Itos),
        ];
        for (code, tos_in, tos_out) in conversions {
            self.def(code, 0, tos_in, tos_out, Gen::Convert(code));
        }

        self.def(bc::LCMP, 0, Ltos, Itos, Gen::Lcmp);
        self.def(bc::FCMPL, 0, Ftos, Itos, Gen::Fcmp(Precision::Single, NanOrder::Less));
        self.def(bc::FCMPG, 0, Ftos, Itos, Gen::Fcmp(Precision::Single, NanOrder::Greater));
        self.def(bc::DCMPL, 0, Dtos, Itos, Gen::Fcmp(Precision::Double, NanOrder::Less));
        self.def(bc::DCMPG, 0, Dtos, Itos, Gen::Fcmp(Precision::Double, NanOrder::Greater));

        let conds = [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Ge, Cond::Gt, Cond::Le];
        for (i, cond) in conds.into_iter().enumerate() {
            let i = i as u8;
            self.def(bc::IFEQ + i, DISP | VM, Itos, Vtos, Gen::IfZero(cond));
            self.def(bc::IF_ICMPEQ + i, DISP | VM, Itos, Vtos, Gen::IfIcmp(cond));
        }
        self.def(bc::IF_ACMPEQ, DISP | VM, Atos, Vtos, Gen::IfAcmp(Cond::Eq));
        self.def(bc::IF_ACMPNE, DISP | VM, Atos, Vtos, Gen::IfAcmp(Cond::Ne));
        self.def(bc::IFNULL, DISP | VM, Atos, Vtos, Gen::IfNull(Cond::Eq));
        self.def(bc::IFNONNULL, DISP | VM, Atos, Vtos, Gen::IfNull(Cond::Ne));
        self.def(bc::GOTO, DISP | VM, Vtos, Vtos, Gen::Goto { wide: false });
        self.def(bc::GOTO_W, DISP | VM, Vtos, Vtos, Gen::Goto { wide: true });
        self.def(bc::TABLESWITCH, DISP | VM, Itos, Vtos, Gen::Tableswitch);
        self.def(bc::LOOKUPSWITCH, DISP | VM, Itos, Vtos, Gen::Lookupswitch);

        self.def(bc::IRETURN, DISP | VM, Itos, Itos, Gen::Return(Itos));
        self.def(bc::LRETURN, DISP | VM, Ltos, Ltos, Gen::Return(Ltos));
        self.def(bc::FRETURN, DISP | VM, Ftos, Ftos, Gen::Return(Ftos));
        self.def(bc::DRETURN, DISP | VM, Dtos, Dtos, Gen::Return(Dtos));
        self.def(bc::ARETURN, DISP | VM, Atos, Atos, Gen::Return(Atos));
        self.def(bc::RETURN, DISP | VM, Vtos, Vtos, Gen::Return(Vtos));
        self.def(bc::RETURN_REGISTER_FINALIZER, DISP | VM, Vtos, Vtos, Gen::ReturnRegisterFinalizer);

        let fields = [
            (bc::GETSTATIC, true, false),
            (bc::PUTSTATIC, true, true),
            (bc::GETFIELD, false, false),
            (bc::PUTFIELD, false, true),
        ];
        for (code, is_static, is_put) in fields {
            self.def(code, VM, Vtos, Vtos, Gen::Field { is_static, is_put });
        }
        for code in [bc::INVOKEVIRTUAL, bc::INVOKESPECIAL, bc::INVOKESTATIC, bc::INVOKEINTERFACE] {
            self.def(code, DISP | VM, Vtos, Vtos, Gen::Invoke(code));
        }

        self.def(bc::NEW, VM, Vtos, Atos, Gen::New);
        self.def(bc::NEWARRAY, VM, Itos, Atos, Gen::Newarray);
        self.def(bc::ANEWARRAY, VM, Itos, Atos, Gen::Anewarray);
        self.def(bc::MULTIANEWARRAY, VM, Vtos, Atos, Gen::Multianewarray);
        self.def(bc::ARRAYLENGTH, 0, Atos, Itos, Gen::Arraylength);
        self.def(bc::ATHROW, DISP, Atos, Vtos, Gen::Athrow);
        self.def(bc::CHECKCAST, VM, Atos, Atos, Gen::Checkcast);
        self.def(bc::INSTANCEOF, VM, Atos, Itos, Gen::Instanceof);
        self.def(bc::MONITORENTER, VM, Atos, Vtos, Gen::Monitorenter);
        self.def(bc::MONITOREXIT, VM, Atos, Vtos, Gen::Monitorexit);
        self.def(bc::WIDE, DISP, Vtos, Vtos, Gen::Wide);

        for code in [bc::JSR, bc::JSR_W, bc::RET, bc::INVOKEDYNAMIC] {
            self.def(code, DISP, Vtos, Vtos, Gen::Unimplemented);
        }
        self.def_wide(bc::RET, Vtos, Vtos, Gen::Unimplemented);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_defined_opcode_has_a_template() {
        let table = TemplateTable::new();
        for code in 0..=255u8 {
            assert_eq!(
                table.template(code).is_some(),
                bc::is_defined(code),
                "opcode {:#x}",
                code
            );
        }
    }

    #[test]
    fn test_wide_templates_match_wide_capable_opcodes() {
        let table = TemplateTable::new();
        for code in 0..=255u8 {
            assert_eq!(table.wide_template(code).is_some(), bc::is_wide_capable(code));
        }
        let iload_w = table.wide_template(bc::ILOAD).unwrap();
        assert_eq!(iload_w.tos_out, TosState::Itos);
        assert_eq!(table.wide_template(bc::LSTORE).unwrap().tos_in, TosState::Ltos);
    }

    #[test]
    fn test_tos_states_of_representative_templates() {
        let table = TemplateTable::new();
        let t = table.template(bc::IADD).unwrap();
        assert_eq!((t.tos_in, t.tos_out), (TosState::Itos, TosState::Itos));
        let t = table.template(bc::LSHL).unwrap();
        assert_eq!((t.tos_in, t.tos_out), (TosState::Itos, TosState::Ltos));
        let t = table.template(bc::BALOAD).unwrap();
        assert_eq!(t.tos_out, TosState::Itos);
        let t = table.template(bc::AASTORE).unwrap();
        assert_eq!(t.tos_in, TosState::Vtos);
        assert!(t.calls_vm());
        assert!(table.template(bc::GOTO).unwrap().does_dispatch());
        assert!(!table.template(bc::IADD).unwrap().does_dispatch());
        assert_eq!(table.template(bc::ICONST_M1).unwrap().body, Gen::Iconst(-1));
        assert_eq!(table.template(bc::ICONST_5).unwrap().body, Gen::Iconst(5));
    }

    #[test]
    fn test_unimplemented_bytecodes() {
        let table = TemplateTable::new();
        for code in [bc::JSR, bc::JSR_W, bc::RET, bc::INVOKEDYNAMIC] {
            assert!(table.template(code).unwrap().is_unimplemented());
        }
        assert!(table.wide_template(bc::RET).unwrap().is_unimplemented());
        assert!(!table.template(bc::RETURN_REGISTER_FINALIZER).unwrap().is_unimplemented());
    }
}
