//! Text assembler for method bodies.
//!
//! One instruction per line, in the usual mnemonic syntax:
//!
//! ```text
//! ; count down from the first argument
//!         iload_0
//! loop:   ifle done
//!         iinc 0 -1
//!         goto loop
//! done:   getstatic Counter.hits I
//!         invokestatic java/lang/Math.abs(D)D
//!         ldc "text"
//!         tableswitch 0 default=other a b
//!         lookupswitch default=other 10:a 20:b
//! .catch start end handler java/lang/ArithmeticException
//! .max_stack 4
//! ```
//!
//! Labels end with `:` and may share a line with an instruction. `ldc`
//! takes an int, a float (`1.5f`), a long (`7L`), a double (`2.0` or
//! `2.0d`), a string in double quotes or `class Name`. Comments start with
//! `//`, or with a `;` that begins a token; a `;` inside a word is part of
//! a descriptor such as `(Ljava/lang/String;)V`.

use std::collections::HashMap;
use std::fmt;

use crate::interpreter::bytecodes as bc;

use super::classfile::{CodeBuilder, Label};
use super::oop::BasicType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    pub line: usize,
    pub message: String,
}

impl AsmError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for AsmError {}

type AsmResult<T> = Result<T, AsmError>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
}

/// Split a line into words and string literals, dropping the comment.
fn tokenize(line: usize, text: &str) -> AsmResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            ';' => break,
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    break;
                }
                // a lone slash starts a word, as in class names
                let mut word = String::from('/');
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err(AsmError::new(line, "unterminated string")),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            other => {
                                return Err(AsmError::new(line, format!("bad escape {:?}", other)));
                            }
                        },
                        Some(c) => s.push(c),
                    }
                }
                tokens.push(Token::Str(s));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    // `;` inside a word belongs to a descriptor
                    if c.is_whitespace() || c == '"' {
                        break;
                    }
                    if c == '/' && word.ends_with('/') {
                        word.pop();
                        return finish_with_comment(tokens, word);
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

fn finish_with_comment(mut tokens: Vec<Token>, word: String) -> AsmResult<Vec<Token>> {
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    Ok(tokens)
}

struct Assembler<'c, 'a> {
    code: &'c mut CodeBuilder<'a>,
    labels: HashMap<String, Label>,
    bound: HashMap<String, usize>,
    /// First line each label is used on.
    used: Vec<(String, usize)>,
}

impl<'c, 'a> Assembler<'c, 'a> {
    fn label(&mut self, name: &str, line: usize) -> Label {
        if !self.bound.contains_key(name) && !self.used.iter().any(|(n, _)| n == name) {
            self.used.push((name.to_string(), line));
        }
        if let Some(l) = self.labels.get(name) {
            return *l;
        }
        let l = self.code.new_label();
        self.labels.insert(name.to_string(), l);
        l
    }

    fn bind(&mut self, name: &str, line: usize) -> AsmResult<()> {
        if let Some(previous) = self.bound.insert(name.to_string(), line) {
            return Err(AsmError::new(
                line,
                format!("label {} already defined on line {}", name, previous),
            ));
        }
        let l = match self.labels.get(name) {
            Some(l) => *l,
            None => {
                let l = self.code.new_label();
                self.labels.insert(name.to_string(), l);
                l
            }
        };
        self.code.bind(l);
        Ok(())
    }

    fn line(&mut self, line: usize, text: &str) -> AsmResult<()> {
        let mut tokens = tokenize(line, text)?;
        // leading labels
        while let Some(Token::Word(w)) = tokens.first() {
            let Some(name) = w.strip_suffix(':') else {
                break;
            };
            if name.is_empty() {
                return Err(AsmError::new(line, "empty label"));
            }
            let name = name.to_string();
            tokens.remove(0);
            self.bind(&name, line)?;
        }
        let Some(first) = tokens.first() else {
            return Ok(());
        };
        let Token::Word(mnemonic) = first.clone() else {
            return Err(AsmError::new(line, "expected an instruction"));
        };
        let args = &tokens[1..];
        if let Some(directive) = mnemonic.strip_prefix('.') {
            return self.directive(line, directive, args);
        }
        let code = bc::by_name(&mnemonic).ok_or_else(|| AsmError::new(line, format!("unknown instruction {}", mnemonic)))?;
        self.instruction(line, code, &mnemonic, args)
    }

    fn directive(&mut self, line: usize, name: &str, args: &[Token]) -> AsmResult<()> {
        match name {
            "max_stack" => {
                let n = int_arg(line, args, 0)?;
                self.code.set_max_stack(to_u16(line, n)?);
            }
            "max_locals" => {
                let n = int_arg(line, args, 0)?;
                self.code.set_max_locals(to_u16(line, n)?);
            }
            "catch" => {
                let start = word_arg(line, args, 0)?;
                let end = word_arg(line, args, 1)?;
                let handler = word_arg(line, args, 2)?;
                let start = self.label(start, line);
                let end = self.label(end, line);
                let handler = self.label(handler, line);
                let catch = match args.get(3) {
                    Some(_) => Some(word_arg(line, args, 3)?),
                    None => None,
                };
                self.code.try_catch(start, end, handler, catch);
            }
            other => return Err(AsmError::new(line, format!("unknown directive .{}", other))),
        }
        Ok(())
    }

    fn instruction(&mut self, line: usize, code: u8, mnemonic: &str, args: &[Token]) -> AsmResult<()> {
        let expect = |n: usize| -> AsmResult<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(AsmError::new(
                    line,
                    format!("{} takes {} operand(s), got {}", mnemonic, n, args.len()),
                ))
            }
        };
        match code {
            bc::BIPUSH => {
                expect(1)?;
                let v = int_arg(line, args, 0)?;
                let v = i8::try_from(v).map_err(|_| AsmError::new(line, format!("{} does not fit bipush", v)))?;
                self.code.op_u8(code, v as u8);
            }
            bc::SIPUSH => {
                expect(1)?;
                let v = int_arg(line, args, 0)?;
                let v = i16::try_from(v).map_err(|_| AsmError::new(line, format!("{} does not fit sipush", v)))?;
                self.code.op_u16(code, v as u16);
            }
            bc::LDC | bc::LDC_W | bc::LDC2_W => self.ldc(line, code, args)?,
            bc::ILOAD..=bc::ALOAD | bc::ISTORE..=bc::ASTORE => {
                expect(1)?;
                let index = to_u16(line, int_arg(line, args, 0)?)?;
                self.code.local_op(code, index);
            }
            bc::ILOAD_0..=bc::ALOAD_3 => {
                expect(0)?;
                let n = code - bc::ILOAD_0;
                self.code.local_op(bc::ILOAD + n / 4, u16::from(n % 4));
            }
            bc::ISTORE_0..=bc::ASTORE_3 => {
                expect(0)?;
                let n = code - bc::ISTORE_0;
                self.code.local_op(bc::ISTORE + n / 4, u16::from(n % 4));
            }
            bc::IINC => {
                expect(2)?;
                let index = to_u16(line, int_arg(line, args, 0)?)?;
                let delta = int_arg(line, args, 1)?;
                let delta = i16::try_from(delta).map_err(|_| AsmError::new(line, "iinc delta out of range"))?;
                self.code.iinc(index, delta);
            }
            bc::IFEQ..=bc::GOTO | bc::IFNULL | bc::IFNONNULL | bc::GOTO_W => {
                expect(1)?;
                let target = self.label(word_arg(line, args, 0)?, line);
                self.code.branch(code, target);
            }
            bc::TABLESWITCH => {
                let low = int_arg(line, args, 0)?;
                let low = i32::try_from(low).map_err(|_| AsmError::new(line, "tableswitch low out of range"))?;
                let default = self.default_label(line, args.get(1))?;
                let mut targets = Vec::new();
                for i in 2..args.len() {
                    let name = word_arg(line, args, i)?;
                    targets.push(self.label(name, line));
                }
                if targets.is_empty() {
                    return Err(AsmError::new(line, "tableswitch without targets"));
                }
                self.code.tableswitch(low, default, &targets);
            }
            bc::LOOKUPSWITCH => {
                let default = self.default_label(line, args.first())?;
                let mut pairs = Vec::new();
                for i in 1..args.len() {
                    let pair = word_arg(line, args, i)?;
                    let (key, target) = pair
                        .split_once(':')
                        .ok_or_else(|| AsmError::new(line, format!("expected key:label, got {}", pair)))?;
                    let key = parse_int(key).and_then(|k| i32::try_from(k).ok()).ok_or_else(|| AsmError::new(line, format!("bad key {}", key)))?;
                    if pairs.iter().any(|(k, _)| *k == key) {
                        return Err(AsmError::new(line, format!("duplicate key {}", key)));
                    }
                    pairs.push((key, self.label(target, line)));
                }
                self.code.lookupswitch(default, &pairs);
            }
            bc::GETSTATIC..=bc::PUTFIELD => {
                expect(2)?;
                let (class, name) = member(line, word_arg(line, args, 0)?)?;
                let descriptor = word_arg(line, args, 1)?;
                self.code.field_op(code, class, name, descriptor);
            }
            bc::INVOKEVIRTUAL..=bc::INVOKEINTERFACE => {
                // `Class.name(desc)` or `Class.name (desc)`
                let joined: String = match args {
                    [Token::Word(a)] => a.clone(),
                    [Token::Word(a), Token::Word(b)] => format!("{}{}", a, b),
                    _ => return Err(AsmError::new(line, format!("{} takes Class.name(descriptor)", mnemonic))),
                };
                let paren = joined
                    .find('(')
                    .ok_or_else(|| AsmError::new(line, format!("missing descriptor in {}", joined)))?;
                let (class, name) = member(line, &joined[..paren])?;
                self.code.invoke(code, class, name, &joined[paren..]);
            }
            bc::NEW | bc::ANEWARRAY | bc::CHECKCAST | bc::INSTANCEOF => {
                expect(1)?;
                self.code.class_op(code, word_arg(line, args, 0)?);
            }
            bc::NEWARRAY => {
                expect(1)?;
                let ty = word_arg(line, args, 0)?;
                let elem = BasicType::ALL
                    .into_iter()
                    .find(|t| !t.is_reference() && t.name() == ty && *t != BasicType::Void)
                    .ok_or_else(|| AsmError::new(line, format!("bad array element type {}", ty)))?;
                self.code.newarray(elem);
            }
            bc::MULTIANEWARRAY => {
                expect(2)?;
                let class = word_arg(line, args, 0)?;
                let dims = int_arg(line, args, 1)?;
                let dims = u8::try_from(dims)
                    .ok()
                    .filter(|d| *d > 0)
                    .ok_or_else(|| AsmError::new(line, "bad dimension count"))?;
                self.code.multianewarray(class, dims);
            }
            bc::WIDE => return Err(AsmError::new(line, "wide is chosen automatically")),
            bc::JSR | bc::RET | bc::JSR_W | bc::INVOKEDYNAMIC => {
                return Err(AsmError::new(line, format!("{} is not supported", mnemonic)));
            }
            _ => {
                expect(0)?;
                self.code.op(code);
            }
        }
        Ok(())
    }

    fn default_label(&mut self, line: usize, token: Option<&Token>) -> AsmResult<Label> {
        match token {
            Some(Token::Word(w)) => match w.strip_prefix("default=") {
                Some(name) => Ok(self.label(name, line)),
                None => Err(AsmError::new(line, format!("expected default=label, got {}", w))),
            },
            _ => Err(AsmError::new(line, "missing default=label")),
        }
    }

    fn ldc(&mut self, line: usize, code: u8, args: &[Token]) -> AsmResult<()> {
        match args {
            [Token::Str(s)] => {
                self.code.ldc_string(s);
            }
            [Token::Word(kw), Token::Word(name)] if kw == "class" => {
                self.code.ldc_class(name);
            }
            [Token::Word(w)] => {
                let wide = code == bc::LDC2_W;
                if let Some(v) = w.strip_suffix(['L', 'l']).and_then(parse_int) {
                    self.code.ldc_long(v);
                } else if let Some(v) = w.strip_suffix(['f', 'F']).and_then(|s| s.parse::<f32>().ok()) {
                    self.code.ldc_float(v);
                } else if let Some(v) = w.strip_suffix(['d', 'D']).and_then(|s| s.parse::<f64>().ok()) {
                    self.code.ldc_double(v);
                } else if let Some(v) = parse_int(w) {
                    if wide {
                        self.code.ldc_long(v);
                    } else {
                        let v = i32::try_from(v).map_err(|_| AsmError::new(line, format!("{} does not fit an int", v)))?;
                        self.code.iconst(v);
                    }
                } else if let Ok(v) = w.parse::<f64>() {
                    self.code.ldc_double(v);
                } else {
                    return Err(AsmError::new(line, format!("bad constant {}", w)));
                }
            }
            _ => return Err(AsmError::new(line, "ldc takes one constant")),
        }
        Ok(())
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if neg { -v } else { v })
}

fn word_arg(line: usize, args: &[Token], i: usize) -> AsmResult<&str> {
    match args.get(i) {
        Some(Token::Word(w)) => Ok(w),
        Some(Token::Str(_)) => Err(AsmError::new(line, format!("operand {} must not be a string", i + 1))),
        None => Err(AsmError::new(line, format!("missing operand {}", i + 1))),
    }
}

fn int_arg(line: usize, args: &[Token], i: usize) -> AsmResult<i64> {
    let w = word_arg(line, args, i)?;
    parse_int(w).ok_or_else(|| AsmError::new(line, format!("expected a number, got {}", w)))
}

fn to_u16(line: usize, v: i64) -> AsmResult<u16> {
    u16::try_from(v).map_err(|_| AsmError::new(line, format!("{} out of range", v)))
}

/// Split `Class.name`; the class part may contain `/` and `$`.
fn member(line: usize, text: &str) -> AsmResult<(&str, &str)> {
    text.rsplit_once('.')
        .filter(|(c, n)| !c.is_empty() && !n.is_empty())
        .ok_or_else(|| AsmError::new(line, format!("expected Class.member, got {}", text)))
}

/// Assemble `source` into `code`. Line numbers in errors start at
/// `first_line`.
pub fn assemble(source: &str, first_line: usize, code: &mut CodeBuilder<'_>) -> Result<(), AsmError> {
    let mut asm = Assembler {
        code,
        labels: HashMap::new(),
        bound: HashMap::new(),
        used: Vec::new(),
    };
    for (i, text) in source.lines().enumerate() {
        asm.line(first_line + i, text)?;
    }
    if let Some((name, line)) = asm.used.iter().find(|(n, _)| !asm.bound.contains_key(n)) {
        return Err(AsmError::new(*line, format!("undefined label {}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::classfile::ConstantPoolBuilder;
    use crate::vm::constants::{Constant, MemberRef};

    fn assemble_str(src: &str) -> Result<(Vec<u8>, ConstantPoolBuilder), AsmError> {
        let mut cp = ConstantPoolBuilder::new();
        let mut code = CodeBuilder::new(&mut cp);
        assemble(src, 1, &mut code)?;
        let (bytes, _, _, _) = code.finish().map_err(|e| AsmError::new(0, e.to_string()))?;
        Ok((bytes, cp))
    }

    #[test]
    fn test_branches_and_labels() {
        let (code, _) = assemble_str(
            "
            iload_0
    loop:   ifle done   ; exit
            iinc 0 -1
            goto loop
    done:   iload_0
            ireturn",
        )
        .unwrap();
        assert_eq!(code[0], bc::ILOAD_0);
        assert_eq!(code[1], bc::IFLE);
        assert_eq!(i16::from_be_bytes([code[2], code[3]]), 9);
        assert_eq!(&code[4..7], &[bc::IINC, 0, 0xff]);
        assert_eq!(code[7], bc::GOTO);
        assert_eq!(i16::from_be_bytes([code[8], code[9]]), -6);
    }

    #[test]
    fn test_constants_and_members() {
        let (code, cp) = assemble_str(
            r#"
            ldc "hi // there"
            ldc 7L
            ldc 1.5f
            ldc 100000
            getstatic pkg/A.count I
            invokestatic java/lang/Math.sqrt(D)D
            newarray int
            return"#,
        )
        .unwrap();
        assert_eq!(code[0], bc::LDC);
        assert_eq!(code[2], bc::LDC2_W);
        assert!(code.contains(&bc::GETSTATIC));
        assert!(code.contains(&bc::INVOKESTATIC));
        let entries = cp.entries();
        assert!(entries.contains(&Constant::String("hi // there".into())));
        assert!(entries.contains(&Constant::Long(7)));
        assert!(entries.contains(&Constant::Integer(100000)));
    }

    #[test]
    fn test_reference_descriptors_keep_their_semicolons() {
        assert_eq!(
            tokenize(1, "invokestatic a/B.f(Ljava/lang/String;)V ; call").unwrap(),
            vec![
                Token::Word("invokestatic".into()),
                Token::Word("a/B.f(Ljava/lang/String;)V".into())
            ]
        );
        let (_, cp) = assemble_str(
            "
            invokestatic a/B.f(Ljava/lang/String;)V
            getfield Box.v Ljava/lang/Object;
            putstatic Box.all [Ljava/lang/Object;   ; trailing comment
            return",
        )
        .unwrap();
        let entries = cp.entries();
        let member = |class: &str, name: &str, descriptor: &str| MemberRef {
            class: class.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        };
        assert!(entries.contains(&Constant::Method(member("a/B", "f", "(Ljava/lang/String;)V"))));
        assert!(entries.contains(&Constant::Field(member("Box", "v", "Ljava/lang/Object;"))));
        assert!(entries.contains(&Constant::Field(member("Box", "all", "[Ljava/lang/Object;"))));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = assemble_str("nop\nfrobnicate").unwrap_err();
        assert_eq!(err.line, 2);
        let err = assemble_str("goto nowhere").unwrap_err();
        assert!(err.message.contains("undefined label"));
        let err = assemble_str("x:\nx:\nreturn").unwrap_err();
        assert_eq!(err.line, 2);
        let err = assemble_str("bipush 300").unwrap_err();
        assert!(err.message.contains("bipush"));
        assert!(assemble_str("jsr x").is_err());
    }

    #[test]
    fn test_switches() {
        let (code, _) = assemble_str(
            "
            iload_0
            lookupswitch default=d 5:a 1:b
    a:      iconst_1
            ireturn
    b:      iconst_2
            ireturn
    d:      iconst_0
            ireturn",
        )
        .unwrap();
        assert_eq!(code[1], bc::LOOKUPSWITCH);
        // padded to a 4-byte boundary, then default, npairs
        assert_eq!(i32::from_be_bytes([code[8], code[9], code[10], code[11]]), 2);
        // keys sorted
        assert_eq!(i32::from_be_bytes([code[12], code[13], code[14], code[15]]), 1);
    }
}
