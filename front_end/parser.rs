// ll(1) parser for the textual IR.
//
// Lexing is a logos token stream; parsing is plain recursive descent with
// one token of lookahead (two for the `ret` / next-instruction split). The
// output is a small AST with names still unresolved; `lower` turns it into
// the arena module.

use derive_more::Display;
use logos::Logos;

use crate::middle_end::ir::{int_ty, ptr_ty, void_ty, BinaryOp, Loc, Predicate, Type};

// SECTION: interface

pub fn parse(code: &str) -> Result<ProgramAst, ParseError> {
    let mut parser = Parser::new(code)?;
    program_r(&mut parser)
}

// A parse error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ParseError(pub String);

impl std::error::Error for ParseError {}

// SECTION: AST

#[derive(Clone, Debug)]
pub struct ProgramAst {
    pub funcs: Vec<FuncAst>,
}

#[derive(Clone, Debug)]
pub struct FuncAst {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub ret_ty: Type,
    /// Empty for external declarations.
    pub blocks: Vec<BlockAst>,
}

#[derive(Clone, Debug)]
pub struct BlockAst {
    pub name: String,
    pub insts: Vec<InstAst>,
}

#[derive(Clone, Debug)]
pub struct InstAst {
    pub result: Option<String>,
    pub op: OpcodeAst,
    pub loc: Option<Loc>,
}

#[derive(Clone, Debug)]
pub enum OpAst {
    Local(String),
    Int(i64),
    Null,
}

#[derive(Clone, Debug)]
pub enum CalleeAst {
    Global(String),
    Local(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CastKind {
    Bitcast,
    PtrToInt,
    Trunc,
    SExt,
}

#[derive(Clone, Debug)]
pub enum OpcodeAst {
    Call { callee: CalleeAst, args: Vec<OpAst> },
    Load { addr: OpAst },
    Store { value: OpAst, addr: OpAst },
    Alloca { ty: Type },
    Cast { kind: CastKind, value: OpAst, to: Type },
    Gep { base: OpAst, indices: Vec<OpAst> },
    Binary { op: BinaryOp, lhs: OpAst, rhs: OpAst },
    ICmp { pred: Predicate, lhs: OpAst, rhs: OpAst },
    Phi { incoming: Vec<(OpAst, String)> },
    Branch { target: String },
    CondBranch { cond: OpAst, tt: String, ff: String },
    Switch { cond: OpAst, default: String, cases: Vec<(i64, String)> },
    Ret { value: Option<OpAst> },
}

// SECTION: lexer

#[derive(Logos, Clone, Debug, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
pub enum TokenKind {
    #[token("fn")]
    Fn,
    #[token("null")]
    Null,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semi,
    #[token("=")]
    Equals,
    #[token("->")]
    Arrow,
    #[token("*")]
    Star,
    #[token("!")]
    Bang,
    #[regex(r"@[A-Za-z_.$][A-Za-z0-9_.$]*", |lex| lex.slice()[1..].to_string())]
    Global(String),
    #[regex(r"%[A-Za-z_.$][A-Za-z0-9_.$]*", |lex| lex.slice()[1..].to_string())]
    Local(String),
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r"[A-Za-z_][A-Za-z0-9_.]*", |lex| lex.slice().to_string())]
    Ident(String),
    #[regex(r#""[^"]*""#, |lex| { let s = lex.slice(); s[1..s.len() - 1].to_string() })]
    Str(String),
}

#[derive(Clone, Debug, PartialEq)]
struct Token {
    kind: TokenKind,
    line: u32,
}

fn lex(code: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = vec![];
    let mut lexer = TokenKind::lexer(code);
    while let Some(result) = lexer.next() {
        let line = line_of(code, lexer.span().start);
        match result {
            Ok(kind) => tokens.push(Token { kind, line }),
            Err(()) => {
                return Err(ParseError(format!(
                    "line {line}: unrecognized token {:?}",
                    lexer.slice()
                )))
            }
        }
    }
    Ok(tokens)
}

fn line_of(code: &str, offset: usize) -> u32 {
    code[..offset].bytes().filter(|&b| b == b'\n').count() as u32 + 1
}

// SECTION: parser functionality

#[derive(Clone, Debug)]
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

// utility functions for traversing the token stream and creating error
// messages.
impl Parser {
    fn new(code: &str) -> Result<Self, ParseError> {
        Ok(Parser {
            tokens: lex(code)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn peek2(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos + 1).map(|t| &t.kind)
    }

    fn next(&mut self) -> Result<TokenKind, ParseError> {
        match self.tokens.get(self.pos) {
            Some(token) => {
                self.pos += 1;
                Ok(token.kind.clone())
            }
            None => Err(ParseError("unexpected end of input".to_string())),
        }
    }

    // if the next token has the given kind advances the iterator and returns
    // true, otherwise returns false.
    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), ParseError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {kind:?}")))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            TokenKind::Ident(name) => Ok(name),
            other => Err(self.error(&format!("expected identifier, found {other:?}"))),
        }
    }

    fn expect_global(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            TokenKind::Global(name) => Ok(name),
            other => Err(self.error(&format!("expected @name, found {other:?}"))),
        }
    }

    fn expect_local(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            TokenKind::Local(name) => Ok(name),
            other => Err(self.error(&format!("expected %name, found {other:?}"))),
        }
    }

    fn expect_int(&mut self) -> Result<i64, ParseError> {
        match self.next()? {
            TokenKind::Int(v) => Ok(v),
            other => Err(self.error(&format!("expected integer, found {other:?}"))),
        }
    }

    fn error(&self, message: &str) -> ParseError {
        let line = self
            .tokens
            .get(self.pos.saturating_sub(1))
            .map(|t| t.line)
            .unwrap_or(0);
        ParseError(format!("line {line}: {message}"))
    }
}

// SECTION: grammar

fn program_r(parser: &mut Parser) -> Result<ProgramAst, ParseError> {
    let mut funcs = vec![];
    while parser.peek().is_some() {
        funcs.push(function_r(parser)?);
    }
    Ok(ProgramAst { funcs })
}

fn function_r(parser: &mut Parser) -> Result<FuncAst, ParseError> {
    parser.expect(&TokenKind::Fn)?;
    let name = parser.expect_global()?;

    parser.expect(&TokenKind::LParen)?;
    let mut params = vec![];
    if !parser.eat(&TokenKind::RParen) {
        loop {
            let pname = parser.expect_local()?;
            parser.expect(&TokenKind::Colon)?;
            let ty = type_r(parser)?;
            params.push((pname, ty));
            if !parser.eat(&TokenKind::Comma) {
                break;
            }
        }
        parser.expect(&TokenKind::RParen)?;
    }

    let ret_ty = if parser.eat(&TokenKind::Arrow) {
        type_r(parser)?
    } else {
        void_ty()
    };

    let mut blocks = vec![];
    if parser.eat(&TokenKind::Semi) {
        // external declaration, no body
    } else {
        parser.expect(&TokenKind::LBrace)?;
        while !parser.eat(&TokenKind::RBrace) {
            blocks.push(block_r(parser)?);
        }
        if blocks.is_empty() {
            return Err(parser.error(&format!("function @{name} has an empty body")));
        }
    }

    Ok(FuncAst {
        name,
        params,
        ret_ty,
        blocks,
    })
}

fn type_r(parser: &mut Parser) -> Result<Type, ParseError> {
    let base = parser.expect_ident()?;
    let mut ty = if base == "void" {
        void_ty()
    } else if let Some(width) = base.strip_prefix('i').and_then(|w| w.parse::<u32>().ok()) {
        int_ty(width)
    } else {
        return Err(parser.error(&format!("unknown type {base}")));
    };
    while parser.eat(&TokenKind::Star) {
        ty = ptr_ty(ty);
    }
    Ok(ty)
}

fn block_r(parser: &mut Parser) -> Result<BlockAst, ParseError> {
    let name = parser.expect_ident()?;
    parser.expect(&TokenKind::Colon)?;

    let mut insts = vec![];
    loop {
        match parser.peek() {
            // next block label or end of body
            Some(TokenKind::Ident(_)) if parser.peek2() == Some(&TokenKind::Colon) => break,
            Some(TokenKind::RBrace) | None => break,
            _ => insts.push(inst_r(parser)?),
        }
    }

    Ok(BlockAst { name, insts })
}

fn inst_r(parser: &mut Parser) -> Result<InstAst, ParseError> {
    let result = if matches!(parser.peek(), Some(TokenKind::Local(_)))
        && parser.peek2() == Some(&TokenKind::Equals)
    {
        let name = parser.expect_local()?;
        parser.expect(&TokenKind::Equals)?;
        Some(name)
    } else {
        None
    };

    let op = opcode_r(parser)?;
    let loc = meta_r(parser)?;

    Ok(InstAst { result, op, loc })
}

fn opcode_r(parser: &mut Parser) -> Result<OpcodeAst, ParseError> {
    let opcode = parser.expect_ident()?;
    match opcode.as_str() {
        "call" => {
            let callee = match parser.next()? {
                TokenKind::Global(name) => CalleeAst::Global(name),
                TokenKind::Local(name) => CalleeAst::Local(name),
                other => return Err(parser.error(&format!("expected callee, found {other:?}"))),
            };
            parser.expect(&TokenKind::LParen)?;
            let mut args = vec![];
            if !parser.eat(&TokenKind::RParen) {
                loop {
                    args.push(operand_r(parser)?);
                    if !parser.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                parser.expect(&TokenKind::RParen)?;
            }
            Ok(OpcodeAst::Call { callee, args })
        }
        "load" => Ok(OpcodeAst::Load {
            addr: operand_r(parser)?,
        }),
        "store" => {
            let value = operand_r(parser)?;
            parser.expect(&TokenKind::Comma)?;
            let addr = operand_r(parser)?;
            Ok(OpcodeAst::Store { value, addr })
        }
        "alloca" => Ok(OpcodeAst::Alloca {
            ty: type_r(parser)?,
        }),
        "bitcast" | "ptrtoint" | "trunc" | "sext" => {
            let kind = match opcode.as_str() {
                "bitcast" => CastKind::Bitcast,
                "ptrtoint" => CastKind::PtrToInt,
                "trunc" => CastKind::Trunc,
                _ => CastKind::SExt,
            };
            let value = operand_r(parser)?;
            if !parser.eat(&TokenKind::Ident("to".to_string())) {
                return Err(parser.error("expected `to <type>` after cast operand"));
            }
            let to = type_r(parser)?;
            Ok(OpcodeAst::Cast { kind, value, to })
        }
        "gep" => {
            let base = operand_r(parser)?;
            let mut indices = vec![];
            while parser.eat(&TokenKind::Comma) {
                indices.push(operand_r(parser)?);
            }
            Ok(OpcodeAst::Gep { base, indices })
        }
        "add" | "sub" | "mul" | "div" => {
            let op = match opcode.as_str() {
                "add" => BinaryOp::Add,
                "sub" => BinaryOp::Sub,
                "mul" => BinaryOp::Mul,
                _ => BinaryOp::Div,
            };
            let lhs = operand_r(parser)?;
            parser.expect(&TokenKind::Comma)?;
            let rhs = operand_r(parser)?;
            Ok(OpcodeAst::Binary { op, lhs, rhs })
        }
        "icmp" => {
            let pred = match parser.expect_ident()?.as_str() {
                "eq" => Predicate::Eq,
                "ne" => Predicate::Ne,
                "slt" => Predicate::Slt,
                "sle" => Predicate::Sle,
                "sgt" => Predicate::Sgt,
                "sge" => Predicate::Sge,
                "ult" => Predicate::Ult,
                "ule" => Predicate::Ule,
                "ugt" => Predicate::Ugt,
                "uge" => Predicate::Uge,
                other => return Err(parser.error(&format!("unknown predicate {other}"))),
            };
            let lhs = operand_r(parser)?;
            parser.expect(&TokenKind::Comma)?;
            let rhs = operand_r(parser)?;
            Ok(OpcodeAst::ICmp { pred, lhs, rhs })
        }
        "phi" => {
            let mut incoming = vec![];
            loop {
                parser.expect(&TokenKind::LBracket)?;
                let value = operand_r(parser)?;
                parser.expect(&TokenKind::Comma)?;
                let block = parser.expect_ident()?;
                parser.expect(&TokenKind::RBracket)?;
                incoming.push((value, block));
                if !parser.eat(&TokenKind::Comma) {
                    break;
                }
            }
            Ok(OpcodeAst::Phi { incoming })
        }
        "br" => {
            if let Some(TokenKind::Ident(_)) = parser.peek() {
                Ok(OpcodeAst::Branch {
                    target: parser.expect_ident()?,
                })
            } else {
                let cond = operand_r(parser)?;
                parser.expect(&TokenKind::Comma)?;
                let tt = parser.expect_ident()?;
                parser.expect(&TokenKind::Comma)?;
                let ff = parser.expect_ident()?;
                Ok(OpcodeAst::CondBranch { cond, tt, ff })
            }
        }
        "switch" => {
            let cond = operand_r(parser)?;
            parser.expect(&TokenKind::Comma)?;
            let default = parser.expect_ident()?;
            let mut cases = vec![];
            while parser.eat(&TokenKind::Comma) {
                let value = parser.expect_int()?;
                parser.expect(&TokenKind::Colon)?;
                let target = parser.expect_ident()?;
                cases.push((value, target));
            }
            Ok(OpcodeAst::Switch {
                cond,
                default,
                cases,
            })
        }
        "ret" => {
            let value = match parser.peek() {
                Some(TokenKind::Int(_)) | Some(TokenKind::Null) => Some(operand_r(parser)?),
                // a local is the operand unless it begins the next instruction
                Some(TokenKind::Local(_)) if parser.peek2() != Some(&TokenKind::Equals) => {
                    Some(operand_r(parser)?)
                }
                _ => None,
            };
            Ok(OpcodeAst::Ret { value })
        }
        other => Err(parser.error(&format!("unknown opcode {other}"))),
    }
}

fn operand_r(parser: &mut Parser) -> Result<OpAst, ParseError> {
    match parser.next()? {
        TokenKind::Local(name) => Ok(OpAst::Local(name)),
        TokenKind::Int(v) => Ok(OpAst::Int(v)),
        TokenKind::Null => Ok(OpAst::Null),
        other => Err(parser.error(&format!("expected operand, found {other:?}"))),
    }
}

fn meta_r(parser: &mut Parser) -> Result<Option<Loc>, ParseError> {
    if !parser.eat(&TokenKind::Bang) {
        return Ok(None);
    }
    let file = match parser.next()? {
        TokenKind::Str(file) => file,
        other => return Err(parser.error(&format!("expected \"file\", found {other:?}"))),
    };
    parser.expect(&TokenKind::Colon)?;
    let line = parser.expect_int()?;
    Ok(Some(Loc {
        file,
        line: line as u32,
    }))
}

// SECTION: tests

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_a_small_function() {
        let program = parse(
            r#"
            fn @EO();
            fn @foo(%x: i64) -> i64 {
            entry:
              %c = icmp slt %x, 0 !"foo.c":3
              br %c, fail, ok
            fail:
              call @EO()
              ret -1
            ok:
              ret 0
            }
            "#,
        )
        .unwrap();

        assert_eq!(program.funcs.len(), 2);
        assert!(program.funcs[0].blocks.is_empty());
        let foo = &program.funcs[1];
        assert_eq!(foo.name, "foo");
        assert_eq!(foo.params.len(), 1);
        assert_eq!(foo.blocks.len(), 3);
        assert_eq!(foo.blocks[0].insts.len(), 2);
        assert_eq!(
            foo.blocks[0].insts[0].loc,
            Some(Loc {
                file: "foo.c".to_string(),
                line: 3
            })
        );
        // void-returning call has no result
        assert!(foo.blocks[1].insts[0].result.is_none());
    }

    #[test]
    fn ret_lookahead() {
        // `ret` with no operand at the end of a block
        let program = parse(
            r#"
            fn @f(%p: i64*) {
            entry:
              br next
            next:
              ret
            }
            "#,
        )
        .unwrap();
        let f = &program.funcs[0];
        assert!(matches!(
            f.blocks[1].insts[0].op,
            OpcodeAst::Ret { value: None }
        ));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let err = parse("fn @f() { entry:\n  frobnicate %x\n }").unwrap_err();
        assert!(err.0.contains("unknown opcode"));
    }

    #[test]
    fn switch_cases() {
        let program = parse(
            r#"
            fn @f(%x: i64) -> i64 {
            entry:
              switch %x, other, 0: zero, 1: one
            zero:
              ret 0
            one:
              ret 1
            other:
              ret -1
            }
            "#,
        )
        .unwrap();
        let OpcodeAst::Switch { cases, .. } = &program.funcs[0].blocks[0].insts[0].op else {
            panic!("expected switch");
        };
        assert_eq!(cases, &vec![(0, "zero".to_string()), (1, "one".to_string())]);
    }
}
