//! Method kinds: which specialized entry a method is entered through.

use crate::config::{GcBarrier, InterpreterConfig};
use crate::interpreter::bytecodes;
use crate::vm::method::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MethodKind {
    Zerolocals = 0,
    ZerolocalsSynchronized,
    Native,
    NativeSynchronized,
    Empty,
    Accessor,
    Abstract,
    JavaLangMathSin,
    JavaLangMathCos,
    JavaLangMathTan,
    JavaLangMathAbs,
    JavaLangMathSqrt,
    JavaLangMathLog,
    JavaLangMathLog10,
    JavaLangMathPow,
    JavaLangMathExp,
    JavaLangRefReferenceGet,
}

pub const NUMBER_OF_METHOD_KINDS: usize = 17;

const MATH_METHODS: [(&str, &str, MethodKind); 9] = [
    ("sin", "(D)D", MethodKind::JavaLangMathSin),
    ("cos", "(D)D", MethodKind::JavaLangMathCos),
    ("tan", "(D)D", MethodKind::JavaLangMathTan),
    ("abs", "(D)D", MethodKind::JavaLangMathAbs),
    ("sqrt", "(D)D", MethodKind::JavaLangMathSqrt),
    ("log", "(D)D", MethodKind::JavaLangMathLog),
    ("log10", "(D)D", MethodKind::JavaLangMathLog10),
    ("pow", "(DD)D", MethodKind::JavaLangMathPow),
    ("exp", "(D)D", MethodKind::JavaLangMathExp),
];

impl MethodKind {
    pub const ALL: [MethodKind; NUMBER_OF_METHOD_KINDS] = [
        MethodKind::Zerolocals,
        MethodKind::ZerolocalsSynchronized,
        MethodKind::Native,
        MethodKind::NativeSynchronized,
        MethodKind::Empty,
        MethodKind::Accessor,
        MethodKind::Abstract,
        MethodKind::JavaLangMathSin,
        MethodKind::JavaLangMathCos,
        MethodKind::JavaLangMathTan,
        MethodKind::JavaLangMathAbs,
        MethodKind::JavaLangMathSqrt,
        MethodKind::JavaLangMathLog,
        MethodKind::JavaLangMathLog10,
        MethodKind::JavaLangMathPow,
        MethodKind::JavaLangMathExp,
        MethodKind::JavaLangRefReferenceGet,
    ];

    pub fn from_u8(v: u8) -> Option<MethodKind> {
        Self::ALL.get(v as usize).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_math(self) -> bool {
        (MethodKind::JavaLangMathSin as u8..=MethodKind::JavaLangMathExp as u8).contains(&(self as u8))
    }

    pub fn name(self) -> &'static str {
        match self {
            MethodKind::Zerolocals => "zerolocals",
            MethodKind::ZerolocalsSynchronized => "zerolocals_synchronized",
            MethodKind::Native => "native",
            MethodKind::NativeSynchronized => "native_synchronized",
            MethodKind::Empty => "empty",
            MethodKind::Accessor => "accessor",
            MethodKind::Abstract => "abstract",
            MethodKind::JavaLangMathSin => "java_lang_math_sin",
            MethodKind::JavaLangMathCos => "java_lang_math_cos",
            MethodKind::JavaLangMathTan => "java_lang_math_tan",
            MethodKind::JavaLangMathAbs => "java_lang_math_abs",
            MethodKind::JavaLangMathSqrt => "java_lang_math_sqrt",
            MethodKind::JavaLangMathLog => "java_lang_math_log",
            MethodKind::JavaLangMathLog10 => "java_lang_math_log10",
            MethodKind::JavaLangMathPow => "java_lang_math_pow",
            MethodKind::JavaLangMathExp => "java_lang_math_exp",
            MethodKind::JavaLangRefReferenceGet => "java_lang_ref_reference_get",
        }
    }

    /// Kind used when no entry was generated for `self`.
    pub fn fallback(self, config: &InterpreterConfig) -> Option<MethodKind> {
        match self {
            k if k.is_math() => Some(MethodKind::Native),
            MethodKind::JavaLangRefReferenceGet if config.gc_barrier == GcBarrier::Satb => {
                Some(MethodKind::Zerolocals)
            }
            MethodKind::JavaLangRefReferenceGet => Some(MethodKind::Accessor),
            MethodKind::Empty | MethodKind::Accessor => Some(MethodKind::Zerolocals),
            _ => None,
        }
    }

    /// Classify a linked method.
    pub fn for_method(method: &Method) -> MethodKind {
        let holder = method.holder().name();
        if method.is_abstract() {
            return MethodKind::Abstract;
        }
        if method.is_native() {
            if holder == "java/lang/Math" && method.is_static() {
                if let Some((_, _, kind)) = MATH_METHODS
                    .iter()
                    .find(|(n, d, _)| *n == method.name() && *d == method.descriptor())
                {
                    return *kind;
                }
            }
            return if method.is_synchronized() {
                MethodKind::NativeSynchronized
            } else {
                MethodKind::Native
            };
        }
        if method.is_synchronized() {
            return MethodKind::ZerolocalsSynchronized;
        }
        if holder == "java/lang/ref/Reference"
            && method.name() == "get"
            && method.descriptor() == "()Ljava/lang/Object;"
        {
            return MethodKind::JavaLangRefReferenceGet;
        }
        let code = method.code();
        if code == [bytecodes::RETURN] {
            return MethodKind::Empty;
        }
        if is_accessor_shape(method) {
            return MethodKind::Accessor;
        }
        MethodKind::Zerolocals
    }
}

/// `aload_0; getfield #i; <x>return` on an instance method.
fn is_accessor_shape(method: &Method) -> bool {
    let code = method.code();
    if method.is_static() || code.len() != 5 {
        return false;
    }
    code[0] == bytecodes::ALOAD_0
        && code[1] == bytecodes::GETFIELD
        && matches!(
            code[4],
            bytecodes::IRETURN
                | bytecodes::LRETURN
                | bytecodes::FRETURN
                | bytecodes::DRETURN
                | bytecodes::ARETURN
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_math_range() {
        for kind in MethodKind::ALL {
            assert_eq!(MethodKind::from_u8(kind as u8), Some(kind));
        }
        assert!(MethodKind::JavaLangMathPow.is_math());
        assert!(!MethodKind::Native.is_math());
        assert!(!MethodKind::JavaLangRefReferenceGet.is_math());
    }

    #[test]
    fn test_fallback_chain_ends_in_a_general_entry() {
        let config = InterpreterConfig::default();
        for kind in MethodKind::ALL {
            let mut k = kind;
            while let Some(next) = k.fallback(&config) {
                k = next;
            }
            assert!(matches!(
                k,
                MethodKind::Zerolocals
                    | MethodKind::ZerolocalsSynchronized
                    | MethodKind::Native
                    | MethodKind::NativeSynchronized
                    | MethodKind::Abstract
            ));
        }
        let satb = InterpreterConfig {
            gc_barrier: GcBarrier::Satb,
            ..Default::default()
        };
        assert_eq!(
            MethodKind::JavaLangRefReferenceGet.fallback(&satb),
            Some(MethodKind::Zerolocals)
        );
    }
}
