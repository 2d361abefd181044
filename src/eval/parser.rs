//! Reader for the emitted program text.

use hashbrown::HashMap;

use super::{EvalError, EvalResult, Type};

/// An operand as written.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Local(String),
    Global(String),
    /// Number or `true`/`false`; interpreted against the operand's type.
    Literal(String),
    Vector(Vec<Typed>),
    Zero,
    Poison,
}

/// An operand together with its type.
#[derive(Debug, Clone, PartialEq)]
pub struct Typed {
    pub ty: Type,
    pub value: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

impl BinOp {
    fn parse(s: &str) -> Option<Self> {
        use BinOp::*;
        Some(match s {
            "add" => Add,
            "sub" => Sub,
            "mul" => Mul,
            "udiv" => UDiv,
            "sdiv" => SDiv,
            "urem" => URem,
            "srem" => SRem,
            "and" => And,
            "or" => Or,
            "xor" => Xor,
            "shl" => Shl,
            "lshr" => LShr,
            "ashr" => AShr,
            "fadd" => FAdd,
            "fsub" => FSub,
            "fmul" => FMul,
            "fdiv" => FDiv,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FPTrunc,
    FPExt,
    FPToUI,
    FPToSI,
    UIToFP,
    SIToFP,
    Bitcast,
    PtrToInt,
}

impl CastOp {
    fn parse(s: &str) -> Option<Self> {
        use CastOp::*;
        Some(match s {
            "trunc" => Trunc,
            "zext" => ZExt,
            "sext" => SExt,
            "fptrunc" => FPTrunc,
            "fpext" => FPExt,
            "fptoui" => FPToUI,
            "fptosi" => FPToSI,
            "uitofp" => UIToFP,
            "sitofp" => SIToFP,
            "bitcast" => Bitcast,
            "ptrtoint" => PtrToInt,
            _ => return None,
        })
    }
}

/// Fast-math and wrap flags, accepted and ignored.
const FLAGS: &[&str] = &["nsz", "arcp", "contract", "afn", "reassoc", "nnan", "ninf", "fast", "nuw", "nsw", "exact"];

/// One decoded instruction. `dst` names are stored without the `%`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Binary { dst: String, op: BinOp, ty: Type, a: Operand, b: Operand },
    ICmp { dst: String, pred: String, ty: Type, a: Operand, b: Operand },
    FCmp { dst: String, pred: String, ty: Type, a: Operand, b: Operand },
    Select { dst: String, cond: Typed, a: Typed, b: Typed },
    Cast { dst: String, op: CastOp, value: Typed, to: Type },
    Gep { dst: String, elem: Type, ptr: Typed, index: Typed },
    Load { dst: String, ty: Type, ptr: Typed },
    Store { value: Typed, ptr: Typed },
    Alloca { dst: String, ty: Type },
    ExtractElement { dst: String, vector: Typed, index: Typed },
    InsertElement { dst: String, vector: Typed, elem: Typed, index: Typed },
    Shuffle { dst: String, a: Typed, b: Typed, mask: Typed },
    Phi { dst: String, ty: Type, incoming: Vec<(Operand, String)> },
    Call { dst: Option<String>, ret: Type, func: String, args: Vec<Typed> },
    Asm(String),
    Br(String),
    CondBr { cond: Typed, then: String, otherwise: String },
    Fence,
    Ret,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub label: String,
    pub insts: Vec<Inst>,
}

/// A parsed kernel.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub name: String,
    pub params: Vec<(Type, String)>,
    /// Module-level arrays such as workgroup-local buffers.
    pub globals: Vec<(String, Type)>,
    pub blocks: Vec<Block>,
    labels: HashMap<String, usize>,
}

impl Program {
    pub fn block_index(&self, label: &str) -> Option<usize> {
        self.labels.get(label).copied()
    }
}

/// Drop a trailing `;` comment that is not inside a string.
fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ';' if !quoted => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Parse the first `define` of `text` and the module-level globals.
pub fn parse(text: &str) -> EvalResult<Program> {
    let mut program = Program::default();
    let mut in_body = false;
    let mut defined = false;

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = strip_comment(raw).trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if !in_body {
            if line.starts_with("define ") {
                if defined {
                    return Err(EvalError::Parse { line: line_no, message: "more than one define".to_string() });
                }
                parse_define(line, line_no, &mut program)?;
                in_body = true;
                defined = true;
            } else if line.starts_with('@') {
                program.globals.push(parse_global(line, line_no)?);
            }
            // declarations and attributes carry nothing to evaluate
            continue;
        }
        if line == "}" {
            in_body = false;
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            if let Some(label) = line.strip_suffix(':') {
                start_block(&mut program, label, line_no)?;
                continue;
            }
        }
        if program.blocks.is_empty() {
            start_block(&mut program, "entry", line_no)?;
        }
        let inst = Cursor::new(line.trim(), line_no).inst()?;
        if let Some(block) = program.blocks.last_mut() {
            block.insts.push(inst);
        }
    }

    if !defined {
        return Err(EvalError::Parse { line: 0, message: "no define found".to_string() });
    }
    Ok(program)
}

fn start_block(program: &mut Program, label: &str, line: usize) -> EvalResult<()> {
    if program.labels.insert(label.to_string(), program.blocks.len()).is_some() {
        return Err(EvalError::Parse { line, message: format!("label {label} defined twice") });
    }
    program.blocks.push(Block { label: label.to_string(), insts: Vec::new() });
    Ok(())
}

fn parse_define(line: &str, line_no: usize, program: &mut Program) -> EvalResult<()> {
    let err = |message: &str| EvalError::Parse { line: line_no, message: message.to_string() };
    let at = line.find('@').ok_or_else(|| err("define without a name"))?;
    let open = line[at..].find('(').map(|p| at + p).ok_or_else(|| err("define without parameters"))?;
    let close = line.rfind(')').filter(|&c| c > open).ok_or_else(|| err("unterminated parameter list"))?;
    program.name = line[at + 1..open].to_string();
    for param in line[open + 1..close].split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut cur = Cursor::new(param, line_no);
        let ty = cur.ty()?;
        let name = param
            .rsplit_once('%')
            .map(|(_, name)| name.to_string())
            .ok_or_else(|| err("parameter without a name"))?;
        program.params.push((ty, name));
    }
    Ok(())
}

/// `@local_0 = internal unnamed_addr addrspace(3) global [256 x float] undef, align 16`
fn parse_global(line: &str, line_no: usize) -> EvalResult<(String, Type)> {
    let mut cur = Cursor::new(line, line_no);
    cur.expect("@")?;
    let name = cur.word()?.to_string();
    cur.expect("=")?;
    while !cur.eat_word("global") {
        cur.word()?;
        if cur.eat("(") {
            cur.word()?;
            cur.expect(")")?;
        }
    }
    Ok((name, cur.ty()?))
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str, line: usize) -> Self {
        Self { text, pos: 0, line }
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Parse { line: self.line, message: format!("{} in '{}'", message.into(), self.text) }
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn rest(&self) -> &'a str {
        let text = self.text;
        &text[self.pos..]
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.rest().chars().next()
    }

    /// Consume `token` if it is next.
    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> EvalResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{token}'")))
        }
    }

    fn word(&mut self) -> EvalResult<&'a str> {
        self.skip_whitespace();
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+' | '$')))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("expected a word"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    /// Consume the whole word `word` if it is next.
    fn eat_word(&mut self, word: &str) -> bool {
        let save = self.pos;
        match self.word() {
            Ok(w) if w == word => true,
            _ => {
                self.pos = save;
                false
            }
        }
    }

    fn number(&mut self) -> EvalResult<u32> {
        let w = self.word()?;
        w.parse().map_err(|_| self.error(format!("expected a number, found '{w}'")))
    }

    fn ty(&mut self) -> EvalResult<Type> {
        let mut ty = if self.eat("<") {
            let n = self.number()?;
            if !self.eat_word("x") {
                return Err(self.error("expected 'x'"));
            }
            let elem = self.ty()?;
            self.expect(">")?;
            Type::Vector(n, Box::new(elem))
        } else if self.eat("[") {
            let n = self.number()?;
            if !self.eat_word("x") {
                return Err(self.error("expected 'x'"));
            }
            let elem = self.ty()?;
            self.expect("]")?;
            Type::Array(n, Box::new(elem))
        } else {
            match self.word()? {
                "void" => Type::Void,
                "half" => Type::Half,
                "bfloat" => Type::BFloat,
                "float" => Type::Float,
                "double" => Type::Double,
                w => match w.strip_prefix('i').and_then(|b| b.parse().ok()) {
                    Some(bits) => Type::Int(bits),
                    None => return Err(self.error(format!("unknown type '{w}'"))),
                },
            }
        };
        loop {
            if self.eat_word("addrspace") {
                self.expect("(")?;
                self.number()?;
                self.expect(")")?;
            } else if self.eat("*") {
                ty = Type::Ptr(Box::new(ty));
            } else {
                return Ok(ty);
            }
        }
    }

    fn local(&mut self) -> EvalResult<String> {
        self.expect("%")?;
        Ok(self.word()?.to_string())
    }

    fn operand(&mut self) -> EvalResult<Operand> {
        match self.peek() {
            Some('%') => Ok(Operand::Local(self.local()?)),
            Some('@') => {
                self.expect("@")?;
                Ok(Operand::Global(self.word()?.to_string()))
            }
            Some('<') => {
                self.expect("<")?;
                let mut lanes = vec![self.typed()?];
                while self.eat(",") {
                    lanes.push(self.typed()?);
                }
                self.expect(">")?;
                Ok(Operand::Vector(lanes))
            }
            _ => Ok(match self.word()? {
                "zeroinitializer" => Operand::Zero,
                "poison" | "undef" => Operand::Poison,
                w => Operand::Literal(w.to_string()),
            }),
        }
    }

    fn typed(&mut self) -> EvalResult<Typed> {
        let ty = self.ty()?;
        let value = self.operand()?;
        Ok(Typed { ty, value })
    }

    fn comma(&mut self) -> EvalResult<()> {
        self.expect(",")
    }

    fn skip_flags(&mut self) {
        while FLAGS.iter().any(|f| self.eat_word(f)) {}
    }

    fn label(&mut self) -> EvalResult<String> {
        if !self.eat_word("label") {
            return Err(self.error("expected 'label'"));
        }
        self.local()
    }

    fn inst(&mut self) -> EvalResult<Inst> {
        let dst = if self.peek() == Some('%') {
            let dst = self.local()?;
            self.expect("=")?;
            Some(dst)
        } else {
            None
        };
        let opcode = self.word()?;
        let need = |this: &Self, dst: Option<String>| dst.ok_or_else(|| this.error("missing result name"));

        let inst = match opcode {
            "getelementptr" => {
                self.eat_word("inbounds");
                let elem = self.ty()?;
                self.comma()?;
                let ptr = self.typed()?;
                self.comma()?;
                Inst::Gep { dst: need(self, dst)?, elem, ptr, index: self.typed()? }
            }
            "load" => {
                let ty = self.ty()?;
                self.comma()?;
                Inst::Load { dst: need(self, dst)?, ty, ptr: self.typed()? }
            }
            "store" => {
                let value = self.typed()?;
                self.comma()?;
                Inst::Store { value, ptr: self.typed()? }
            }
            "alloca" => Inst::Alloca { dst: need(self, dst)?, ty: self.ty()? },
            "extractelement" => {
                let vector = self.typed()?;
                self.comma()?;
                Inst::ExtractElement { dst: need(self, dst)?, vector, index: self.typed()? }
            }
            "insertelement" => {
                let vector = self.typed()?;
                self.comma()?;
                let elem = self.typed()?;
                self.comma()?;
                Inst::InsertElement { dst: need(self, dst)?, vector, elem, index: self.typed()? }
            }
            "shufflevector" => {
                let a = self.typed()?;
                self.comma()?;
                let b = self.typed()?;
                self.comma()?;
                Inst::Shuffle { dst: need(self, dst)?, a, b, mask: self.typed()? }
            }
            "icmp" | "fcmp" => {
                self.skip_flags();
                let pred = self.word()?.to_string();
                let ty = self.ty()?;
                let a = self.operand()?;
                self.comma()?;
                let b = self.operand()?;
                let dst = need(self, dst)?;
                if opcode == "icmp" {
                    Inst::ICmp { dst, pred, ty, a, b }
                } else {
                    Inst::FCmp { dst, pred, ty, a, b }
                }
            }
            "select" => {
                let cond = self.typed()?;
                self.comma()?;
                let a = self.typed()?;
                self.comma()?;
                Inst::Select { dst: need(self, dst)?, cond, a, b: self.typed()? }
            }
            "phi" => {
                let ty = self.ty()?;
                let mut incoming = Vec::new();
                loop {
                    self.expect("[")?;
                    let value = self.operand()?;
                    self.comma()?;
                    let block = self.local()?;
                    self.expect("]")?;
                    incoming.push((value, block));
                    if !self.eat(",") {
                        break;
                    }
                }
                Inst::Phi { dst: need(self, dst)?, ty, incoming }
            }
            "tail" | "call" => {
                if opcode == "tail" && !self.eat_word("call") {
                    return Err(self.error("expected 'call'"));
                }
                let ret = self.ty()?;
                if self.eat_word("asm") {
                    return Ok(Inst::Asm(self.rest().trim().to_string()));
                }
                self.expect("@")?;
                let func = self.word()?.to_string();
                self.expect("(")?;
                let mut args = Vec::new();
                if !self.eat(")") {
                    loop {
                        args.push(self.typed()?);
                        if self.eat(")") {
                            break;
                        }
                        self.comma()?;
                    }
                }
                Inst::Call { dst, ret, func, args }
            }
            "br" => {
                if self.peek().is_some_and(|c| c == 'l') {
                    Inst::Br(self.label()?)
                } else {
                    let cond = self.typed()?;
                    self.comma()?;
                    let then = self.label()?;
                    self.comma()?;
                    Inst::CondBr { cond, then, otherwise: self.label()? }
                }
            }
            "fence" => return Ok(Inst::Fence),
            "ret" => return Ok(Inst::Ret),
            other => {
                if let Some(op) = CastOp::parse(other) {
                    let value = self.typed()?;
                    if !self.eat_word("to") {
                        return Err(self.error("expected 'to'"));
                    }
                    Inst::Cast { dst: need(self, dst)?, op, value, to: self.ty()? }
                } else if let Some(op) = BinOp::parse(other) {
                    self.skip_flags();
                    let ty = self.ty()?;
                    let a = self.operand()?;
                    self.comma()?;
                    Inst::Binary { dst: need(self, dst)?, op, ty, a, b: self.operand()? }
                } else {
                    return Err(self.error(format!("unknown instruction '{other}'")));
                }
            }
        };

        // `, align N` may trail memory instructions.
        if self.eat(",") && !(self.eat_word("align") && self.number().is_ok()) {
            return Err(self.error("unexpected trailing operand"));
        }
        if !self.rest().trim().is_empty() {
            return Err(self.error("unexpected trailing text"));
        }
        Ok(inst)
    }
}
