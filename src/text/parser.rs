//! Node-list (KIR) parser implementation.

use hashbrown::HashMap;

use super::ParseError;
use crate::core::dtype::{DType, PtrInfo, ScalarType};
use crate::core::node::{Arg, ConstValue, Graph, Node, NodeId, Op, WmmaArg};

/// Parse a node list into a graph.
pub fn parse(text: &str) -> Result<Graph, ParseError> {
    Parser::new(text).parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
    graph: Graph,
    values: HashMap<&'a str, NodeId>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0, line: 1, graph: Graph::new(), values: HashMap::new() }
    }

    fn parse(mut self) -> Result<Graph, ParseError> {
        self.skip_whitespace(true);
        while !self.is_eof() {
            self.parse_node()?;
            self.skip_whitespace(false);
            if !self.is_eof() && !self.try_newline() {
                return Err(self.error("expected end of line"));
            }
            self.skip_whitespace(true);
        }
        Ok(self.graph)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax { line: self.line, message: message.into() }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            if ch == '\n' {
                self.line += 1;
            }
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_newline(&mut self) -> bool {
        if self.current_char() == Some('\n') {
            self.advance();
            true
        } else {
            false
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), ParseError> {
        if self.try_read(ch) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{ch}'")))
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace(false);
        self.current_char()
    }

    fn parse_ident(&mut self) -> Result<&'a str, ParseError> {
        self.skip_whitespace(false);
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        let text = self.text;
        Ok(&text[start..self.pos])
    }

    fn parse_number(&mut self) -> Result<u32, ParseError> {
        let tok = self.parse_ident()?;
        tok.parse().map_err(|_| self.error(format!("expected a number, found '{tok}'")))
    }

    /// `f32`, `f16x8`, `*f32`, `*f32[16]`, `*local f32[256]`.
    fn parse_type(&mut self) -> Result<DType, ParseError> {
        let ptr = self.try_read('*');
        let mut local = false;
        let mut tok = self.parse_ident()?;
        if ptr && tok == "local" {
            local = true;
            tok = self.parse_ident()?;
        }
        let (scalar, count) = match tok.rsplit_once('x') {
            Some((s, n)) if ScalarType::parse(s).is_some() && !n.is_empty() => {
                let n = n.parse().map_err(|_| self.error(format!("bad lane count in '{tok}'")))?;
                (s, n)
            }
            _ => (tok, 1),
        };
        let scalar = ScalarType::parse(scalar).ok_or_else(|| self.error(format!("unknown type '{tok}'")))?;
        let mut dtype = DType::scalar(scalar).vec(count);
        if ptr {
            let size = if self.peek() == Some('[') && self.is_type_size() {
                self.expect('[')?;
                let n = self.parse_number()?;
                self.expect(']')?;
                Some(n)
            } else {
                None
            };
            dtype.ptr = Some(PtrInfo { local, size });
        }
        Ok(dtype)
    }

    /// `[16]` directly after a pointer type is a size, `[0]` after a space is an argument list.
    fn is_type_size(&self) -> bool {
        self.pos > 0 && !self.text[..self.pos].ends_with(char::is_whitespace)
    }

    fn parse_operand(&mut self) -> Result<NodeId, ParseError> {
        self.expect('%')?;
        let name = self.parse_ident()?;
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| ParseError::UndefinedValue { line: self.line, name: name.to_string() })
    }

    /// Comma separated literals up to `]`.
    fn parse_args(&mut self) -> Result<Vec<&'a str>, ParseError> {
        let text = self.text;
        let start = self.pos;
        let end = text[start..]
            .find(|c: char| c == ']' || c == '\n')
            .map(|i| start + i)
            .filter(|&i| text[i..].starts_with(']'))
            .ok_or_else(|| self.error("unterminated argument list"))?;
        let args = text[start..end].split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        self.pos = end + 1;
        Ok(args)
    }

    fn parse_node(&mut self) -> Result<(), ParseError> {
        let line = self.line;
        let mut result = None;
        if self.peek() == Some('%') {
            self.advance();
            result = Some(self.parse_ident()?);
            self.expect('=')?;
        }
        let op_name = self.parse_ident()?;
        let op = Op::parse(op_name).ok_or_else(|| ParseError::UnknownOp { line, op: op_name.to_string() })?;
        let dtype = self.parse_type()?;

        let mut src = Vec::new();
        if self.peek() == Some('%') {
            src.push(self.parse_operand()?);
            while self.try_read(',') {
                src.push(self.parse_operand()?);
            }
        }
        let args = if self.try_read('[') { self.parse_args()? } else { Vec::new() };
        let arg = self.build_arg(op, dtype, &args)?;

        let id = self
            .graph
            .push(Node::new(op, dtype, src, arg))
            .map_err(|source| ParseError::Graph { line, source })?;
        if let Some(name) = result {
            if self.values.insert(name, id).is_some() {
                return Err(ParseError::Redefined { line, name: name.to_string() });
            }
        }
        Ok(())
    }

    fn build_arg(&self, op: Op, dtype: DType, args: &[&str]) -> Result<Arg, ParseError> {
        let int = |s: &str| s.parse::<i64>().map_err(|_| self.error(format!("expected an integer, found '{s}'")));
        let uint = |s: &str| s.parse::<u32>().map_err(|_| self.error(format!("expected an index, found '{s}'")));
        let scalar = |s: &str| ScalarType::parse(s).ok_or_else(|| self.error(format!("unknown type '{s}'")));
        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(self.error(format!("{op} takes {n} arguments, got {}", args.len())))
            }
        };
        Ok(match op {
            Op::Const => {
                arity(1)?;
                Arg::Const(self.parse_const(args[0], dtype)?)
            }
            Op::DefineGlobal | Op::DefineLocal | Op::Range => {
                arity(1)?;
                Arg::Index(uint(args[0])?)
            }
            Op::DefineVar => {
                arity(3)?;
                Arg::Var { name: args[0].to_string(), min: int(args[1])?, max: int(args[2])? }
            }
            Op::Name => {
                arity(1)?;
                Arg::Name(args[0].to_string())
            }
            Op::Special => {
                arity(2)?;
                Arg::Special { name: args[0].to_string(), size: uint(args[1])? }
            }
            Op::Gep => Arg::Lanes(args.iter().map(|s| uint(*s)).collect::<Result<_, _>>()?),
            Op::Wmma => {
                arity(6)?;
                Arg::Wmma(WmmaArg {
                    name: args[0].to_string(),
                    dtype_in: scalar(args[1])?,
                    dtype_out: scalar(args[2])?,
                    upcast: [uint(args[3])?, uint(args[4])?, uint(args[5])?],
                })
            }
            _ => {
                arity(0)?;
                Arg::None
            }
        })
    }

    fn parse_const(&self, s: &str, dtype: DType) -> Result<ConstValue, ParseError> {
        let bad = || self.error(format!("bad {dtype} constant '{s}'"));
        if dtype.scalar.is_float() {
            let v = match s.to_ascii_lowercase().as_str() {
                "nan" => f64::NAN,
                "inf" | "+inf" => f64::INFINITY,
                "-inf" => f64::NEG_INFINITY,
                _ => s.parse().map_err(|_| bad())?,
            };
            Ok(ConstValue::Float(v))
        } else if dtype.scalar.is_bool() {
            match s {
                "true" | "1" => Ok(ConstValue::Bool(true)),
                "false" | "0" => Ok(ConstValue::Bool(false)),
                _ => Err(bad()),
            }
        } else {
            s.parse().map(ConstValue::Int).map_err(|_| bad())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CompileError;

    #[test]
    fn test_parse_sum_loop() {
        let g = parse(
            "; sum of four floats\n\
             %buf = define_global *f32[4] [0]\n\
             %zero = const i32 [0]\n\
             %four = const i32 [4]\n\
             %init = const f32 [0.0]\n\
             %r = range i32 %zero, %four [0]\n\
             %acc = define_acc f32 %init, %r\n\
             %idx = index *f32[4] %buf, %r\n\
             %x = load f32 %idx\n\
             %sum = add f32 %acc, %x\n\
             %a = assign f32 %acc, %sum\n\
             endrange void %r   ; close the loop\n",
        )
        .unwrap();
        assert_eq!(g.len(), 11);
        assert_eq!(g.nodes()[0].dtype, DType::F32.ptr_sized(4));
        assert_eq!(g.nodes()[4].arg, Arg::Index(0));
        assert_eq!(g.nodes()[10].src, vec![NodeId(4)]);
    }

    #[test]
    fn test_parse_types() {
        let g = parse(
            "%a = define_local *local f32[256] [0]\n\
             %b = define_global *f16x8 [1]\n\
             %c = const f16x8 [1.5]\n\
             %d = const f32 [-inf]\n",
        )
        .unwrap();
        assert_eq!(g.nodes()[0].dtype, DType::F32.local_ptr(256));
        assert_eq!(g.nodes()[1].dtype, DType::F16.vec(8).ptr());
        assert_eq!(g.nodes()[2].dtype, DType::F16.vec(8));
        assert_eq!(g.nodes()[3].arg, Arg::Const(ConstValue::Float(f64::NEG_INFINITY)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("%a = frobnicate f32"), Err(ParseError::UnknownOp { line: 1, .. })));
        assert!(matches!(
            parse("%a = const f32 [1.0]\n%b = add f32 %a, %c"),
            Err(ParseError::UndefinedValue { line: 2, .. })
        ));
        assert!(matches!(parse("%a = const f32 [1.0]\n%a = const f32 [2.0]"), Err(ParseError::Redefined { .. })));
        assert!(matches!(parse("%a = const f32 [1.0, 2.0]"), Err(ParseError::Syntax { .. })));
        assert!(matches!(parse("%a = const f32 [1.0]\n%b = add f32 %a"), Err(ParseError::Graph { line: 2, .. })));
    }

    #[test]
    fn test_parse_accumulator_without_init() {
        let err = parse("%a = define_acc f32\n%b = const f32 [1.0]\n%c = assign f32 %a, %b").unwrap_err();
        assert!(
            matches!(err, ParseError::Graph { line: 1, source: CompileError::InvalidNode { .. } }),
            "{err}"
        );
    }
}
