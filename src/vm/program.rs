//! Programs: classes written as TOML with assembler method bodies.
//!
//! ```toml
//! [[class]]
//! name = "Main"
//!
//! [[class.field]]
//! name = "hits"
//! descriptor = "I"
//! access = ["static"]
//!
//! [[class.method]]
//! name = "main"
//! descriptor = "()I"
//! access = ["public", "static"]
//! code = """
//!     getstatic Main.hits I
//!     ireturn
//! """
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use toml::Spanned;

use crate::error::{VmError, VmResult};

use super::asm::{self, AsmError};
use super::classfile::{ClassBuilder, ClassDefinition, CodeBuilder, OBJECT};
use super::klass::Klass;
use super::method::{MethodSpec, Signature, access};
use super::vm::Vm;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    #[serde(rename = "class", default)]
    pub classes: Vec<ClassSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassSource {
    pub name: String,
    #[serde(rename = "super")]
    pub super_name: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub access: Vec<String>,
    #[serde(rename = "field", default)]
    pub fields: Vec<FieldSource>,
    #[serde(rename = "method", default)]
    pub methods: Vec<MethodSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSource {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub access: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodSource {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub access: Vec<String>,
    pub max_stack: Option<u16>,
    pub max_locals: Option<u16>,
    /// Assembler text; absent for native and abstract methods.
    pub code: Option<Spanned<String>>,
}

fn flags(owner: &str, words: &[String]) -> VmResult<u32> {
    words.iter().try_fold(0, |acc, w| {
        access::by_name(w)
            .map(|f| acc | f)
            .ok_or_else(|| VmError::Program(format!("{}: unknown access flag '{}'", owner, w)))
    })
}

impl Program {
    pub fn from_toml_str(text: &str) -> VmResult<Program> {
        let program: Program = toml::from_str(text).map_err(|e| VmError::Program(e.to_string()))?;
        program.check()?;
        Ok(program)
    }

    pub fn load(path: impl AsRef<Path>) -> VmResult<(Program, String)> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VmError::Program(format!("cannot read {}: {}", path.display(), e)))?;
        let program = Self::from_toml_str(&text)?;
        Ok((program, text))
    }

    fn check(&self) -> VmResult<()> {
        let mut seen = HashMap::new();
        for (i, class) in self.classes.iter().enumerate() {
            if seen.insert(class.name.as_str(), i).is_some() {
                return Err(VmError::Program(format!("class {} defined twice", class.name)));
            }
        }
        Ok(())
    }

    /// Assemble every class against the program text `source` (for line
    /// numbers) and define them in `vm`, superclasses and interfaces first.
    pub fn define<'v>(&self, vm: &'v Vm, source: &str) -> VmResult<Vec<&'v Klass>> {
        let order = self.definition_order()?;
        let mut defined = Vec::with_capacity(order.len());
        for i in order {
            let def = self.classes[i].assemble(source)?;
            defined.push(vm.define_class(def)?);
        }
        Ok(defined)
    }

    /// Indices of classes such that each comes after the program classes
    /// it extends or implements.
    fn definition_order(&self) -> VmResult<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();
        // 0 = unvisited, 1 = in progress, 2 = done
        let mut state = vec![0u8; self.classes.len()];
        let mut order = Vec::with_capacity(self.classes.len());

        fn visit(
            i: usize,
            classes: &[ClassSource],
            index: &HashMap<&str, usize>,
            state: &mut [u8],
            order: &mut Vec<usize>,
        ) -> VmResult<()> {
            match state[i] {
                2 => return Ok(()),
                1 => {
                    return Err(VmError::Program(format!(
                        "class {} is its own supertype",
                        classes[i].name
                    )));
                }
                _ => {}
            }
            state[i] = 1;
            let class = &classes[i];
            for dep in class.super_name.iter().chain(&class.interfaces) {
                if let Some(&d) = index.get(dep.as_str()) {
                    visit(d, classes, index, state, order)?;
                }
            }
            state[i] = 2;
            order.push(i);
            Ok(())
        }

        for i in 0..self.classes.len() {
            visit(i, &self.classes, &index, &mut state, &mut order)?;
        }
        Ok(order)
    }
}

impl ClassSource {
    fn assemble(&self, source: &str) -> VmResult<ClassDefinition> {
        let mut builder = ClassBuilder::new(&self.name);
        builder.access(flags(&self.name, &self.access)?);
        builder.super_class(self.super_name.as_deref().unwrap_or(OBJECT));
        for iface in &self.interfaces {
            builder.interface(iface);
        }
        for f in &self.fields {
            builder.field(&f.name, &f.descriptor, flags(&self.name, &f.access)?);
        }
        for m in &self.methods {
            let owner = format!("{}.{}{}", self.name, m.name, m.descriptor);
            let method_flags = flags(&owner, &m.access)?;
            let Some(code) = &m.code else {
                if method_flags & (access::NATIVE | access::ABSTRACT) == 0 {
                    return Err(VmError::Program(format!("{} has no code", owner)));
                }
                builder.method_without_code(&m.name, &m.descriptor, method_flags);
                continue;
            };
            let signature = Signature::parse(&m.descriptor)
                .ok_or_else(|| VmError::Program(format!("{}: bad descriptor", owner)))?;
            let receiver = usize::from(method_flags & access::STATIC == 0);
            let slots: usize = signature.params.iter().map(|t| t.slots()).sum();
            let params = (slots + receiver) as u16;

            let first_line = code_line(source, code);
            let mut cb = CodeBuilder::new(builder.constants());
            asm::assemble(code.get_ref(), first_line, &mut cb).map_err(|e| annotate(&owner, e))?;
            let (bytes, exception_table, max_stack, max_locals) = cb.finish()?;
            builder.raw_method(MethodSpec {
                name: m.name.clone(),
                descriptor: m.descriptor.clone(),
                access_flags: method_flags,
                max_locals: m.max_locals.unwrap_or(0).max(max_locals).max(params),
                max_stack: m.max_stack.unwrap_or(0).max(max_stack),
                code: bytes,
                exception_table,
            });
        }
        Ok(builder.build())
    }
}

fn annotate(owner: &str, e: AsmError) -> VmError {
    VmError::Asm(AsmError {
        line: e.line,
        message: format!("{}: {}", owner, e.message),
    })
}

/// Line of `source` holding the first line of the string value `code`.
fn code_line(source: &str, code: &Spanned<String>) -> usize {
    let start = code.span().start.min(source.len());
    let mut line = source[..start].matches('\n').count() + 1;
    let rest = &source[start..];
    // a newline right after the opening quotes is not part of the value
    if rest.starts_with("\"\"\"\n") || rest.starts_with("'''\n") || rest.starts_with("\"\"\"\r\n") {
        line += 1;
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterpreterConfig;
    use crate::vm::javacalls::JavaValue;

    const SHAPES: &str = r#"
[[class]]
name = "Square"
super = "Shape"

[[class.method]]
name = "area"
descriptor = "()I"
code = """
    iconst_4
    ireturn
"""

[[class]]
name = "Shape"
access = ["abstract"]

[[class.field]]
name = "count"
descriptor = "I"
access = ["static"]

[[class.method]]
name = "area"
descriptor = "()I"
access = ["abstract"]

[[class.method]]
name = "<init>"
descriptor = "()V"
code = """
    aload_0
    invokespecial java/lang/Object.<init>()V
    return
"""
"#;

    #[test]
    fn test_definition_order_puts_supertypes_first() {
        let program = Program::from_toml_str(SHAPES).unwrap();
        assert_eq!(program.definition_order().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_define_and_call() {
        let src = format!(
            "{}{}",
            SHAPES,
            r#"
[[class.method]]
name = "<init>"
descriptor = "()V"
code = """
    aload_0
    invokespecial Shape.<init>()V
    return
"""

[[class]]
name = "Main"

[[class.method]]
name = "main"
descriptor = "()I"
access = ["static"]
code = """
    new Square
    dup
    invokespecial Square.<init>()V
    invokevirtual Shape.area()I
    ireturn
"""
"#
        );
        let program = Program::from_toml_str(&src).unwrap();
        // the appended <init> belongs to Shape, the last class in SHAPES
        assert_eq!(program.classes[1].methods.len(), 3);
        let vm = Vm::new(InterpreterConfig::default()).unwrap();
        let classes = program.define(&vm, &src).unwrap();
        assert_eq!(classes.len(), 3);
        assert!(vm.find_class("Shape").unwrap().is_abstract());
        let result = vm.call_static("Main", "main", "()I", &[]).unwrap();
        assert_eq!(result, JavaValue::Int(4));
    }

    #[test]
    fn test_assembly_errors_point_into_the_file() {
        let src = "[[class]]\nname = \"Bad\"\n\n[[class.method]]\nname = \"f\"\ndescriptor = \"()V\"\naccess = [\"static\"]\ncode = \"\"\"\n    nop\n    bogus\n\"\"\"\n";
        let program = Program::from_toml_str(src).unwrap();
        let vm = Vm::new(InterpreterConfig::default()).unwrap();
        match program.define(&vm, src) {
            Err(VmError::Asm(e)) => {
                assert_eq!(e.line, 10);
                assert!(e.message.contains("Bad.f()V"));
            }
            other => panic!("expected an assembly error, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_rejects_unknown_flags_and_missing_code() {
        let src = "[[class]]\nname = \"A\"\naccess = [\"sealed\"]\n";
        let program = Program::from_toml_str(src).unwrap();
        let vm = Vm::new(InterpreterConfig::default()).unwrap();
        assert!(matches!(program.define(&vm, src), Err(VmError::Program(_))));

        let src = "[[class]]\nname = \"B\"\n[[class.method]]\nname = \"f\"\ndescriptor = \"()V\"\n";
        let program = Program::from_toml_str(src).unwrap();
        assert!(matches!(program.define(&vm, src), Err(VmError::Program(_))));

        assert!(Program::from_toml_str("[[class]]\nname = \"C\"\n[[class]]\nname = \"C\"\n").is_err());
    }
}
