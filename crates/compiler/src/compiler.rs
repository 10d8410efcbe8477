//! Single-pass Pratt compiler: walks tokens once, emitting bytecode directly
//! into the chunk of whichever function is currently being compiled.

use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileErrors};
use crate::scanner::{Scanner, Token, TokenKind};
use lumen_core::{Chunk, Heap, ObjFunction, OpCode, Value};
use std::ptr;

type Obj = lumen_core::Obj;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Sub,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Sub,
            Sub => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn = for<'s, 'h> fn(&mut Parser<'s, 'h>, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

const fn rule(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> ParseRule {
    ParseRule { prefix, infix, precedence }
}

fn get_rule(kind: TokenKind) -> ParseRule {
    use Precedence::*;
    use TokenKind::*;
    match kind {
        LeftParen => rule(Some(Parser::grouping), Some(Parser::call), Call),
        LeftBrack => rule(Some(Parser::list_literal), Some(Parser::index), Sub),
        Dot => rule(None, Some(Parser::dot), Call),
        Minus => rule(Some(Parser::unary), Some(Parser::binary), Term),
        Plus => rule(None, Some(Parser::binary), Term),
        Slash => rule(None, Some(Parser::binary), Factor),
        Star => rule(None, Some(Parser::binary), Factor),
        Percent => rule(None, Some(Parser::binary), Factor),
        Caret => rule(None, Some(Parser::binary), Factor),
        Bang => rule(Some(Parser::unary), None, None),
        BangEqual => rule(None, Some(Parser::binary), Equality),
        EqualEqual => rule(None, Some(Parser::binary), Equality),
        Greater => rule(None, Some(Parser::binary), Comparison),
        GreaterEqual => rule(None, Some(Parser::binary), Comparison),
        Less => rule(None, Some(Parser::binary), Comparison),
        LessEqual => rule(None, Some(Parser::binary), Comparison),
        AndAnd => rule(None, Some(Parser::and_), And),
        OrOr => rule(None, Some(Parser::or_), Or),
        Identifier => rule(Some(Parser::variable), None, None),
        String => rule(Some(Parser::string_lit), None, None),
        Number => rule(Some(Parser::number), None, None),
        This => rule(Some(Parser::this_), None, None),
        Super => rule(Some(Parser::super_), None, None),
        False | True | Nil => rule(Some(Parser::literal), None, None),
        _ => rule(None, None, Precedence::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

struct CompilerState {
    enclosing: Option<Box<CompilerState>>,
    function: *mut Obj,
    ftype: FunctionType,
    locals: Vec<Local>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl CompilerState {
    fn new(ftype: FunctionType, function: *mut Obj) -> Self {
        let reserved = if matches!(ftype, FunctionType::Method | FunctionType::Initializer) {
            "this".to_string()
        } else {
            String::new()
        };
        CompilerState {
            enclosing: None,
            function,
            ftype,
            locals: vec![Local { name: reserved, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    /// Safety: `function` is owned by this compiler context for its whole
    /// lifetime and not yet shared with anything that would alias it.
    fn function_mut(&self) -> &mut ObjFunction {
        unsafe { (*self.function).as_function_mut().expect("compiler function slot is a Function") }
    }
}

struct ClassCompilerState {
    enclosing: Option<Box<ClassCompilerState>>,
    has_superclass: bool,
}

fn find_local(compiler: &CompilerState, name: &str) -> Option<(u8, bool)> {
    for (i, local) in compiler.locals.iter().enumerate().rev() {
        if local.name == name {
            return Some((i as u8, local.depth == -1));
        }
    }
    None
}

fn add_upvalue(compiler: &mut CompilerState, index: u8, is_local: bool) -> Result<u8, String> {
    for (i, uv) in compiler.upvalues.iter().enumerate() {
        if uv.index == index && uv.is_local == is_local {
            return Ok(i as u8);
        }
    }
    if compiler.upvalues.len() >= 256 {
        return Err("Too many closure variables in function.".to_string());
    }
    compiler.upvalues.push(Upvalue { index, is_local });
    Ok((compiler.upvalues.len() - 1) as u8)
}

fn resolve_upvalue(compiler: &mut CompilerState, name: &str) -> Result<Option<u8>, String> {
    let enclosing = match compiler.enclosing.as_deref_mut() {
        Some(e) => e,
        None => return Ok(None),
    };
    if let Some((local, _uninit)) = find_local(enclosing, name) {
        enclosing.locals[local as usize].is_captured = true;
        return add_upvalue(compiler, local, true).map(Some);
    }
    if let Some(up) = resolve_upvalue(enclosing, name)? {
        return add_upvalue(compiler, up, false).map(Some);
    }
    Ok(None)
}

pub struct Parser<'src, 'heap> {
    scanner: Scanner<'src>,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    compiler: CompilerState,
    current_class: Option<Box<ClassCompilerState>>,
    heap: &'heap mut dyn Heap,
    config: CompilerConfig,
}

impl<'src, 'heap> Parser<'src, 'heap> {
    fn new(source: &'src str, heap: &'heap mut dyn Heap, config: CompilerConfig) -> Self {
        let function = heap.alloc_function(ObjFunction::new(None));
        Parser {
            scanner: Scanner::new(source),
            previous: Token { kind: TokenKind::Eof, lexeme: String::new(), line: 0 },
            current: Token { kind: TokenKind::Eof, lexeme: String::new(), line: 0 },
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            compiler: CompilerState::new(FunctionType::Script, function),
            current_class: None,
            heap,
            config,
        }
    }

    // --- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.clone();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    // --- error reporting ----------------------------------------------

    fn error_at(&mut self, token: &Token, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = if token.kind == TokenKind::Eof {
            " at end".to_string()
        } else if token.kind == TokenKind::Error {
            String::new()
        } else {
            format!(" at '{}'", token.lexeme)
        };
        self.errors.push(CompileError { line: token.line, at, message: msg.to_string() });
    }

    fn error(&mut self, msg: &str) {
        let tok = self.previous.clone();
        self.error_at(&tok, msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        let tok = self.current.clone();
        self.error_at(&tok, msg);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Func | Let | For | If | While | Return | Match => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- bytecode emission ----------------------------------------------

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.compiler.function_mut().chunk
    }

    fn chunk_len(&mut self) -> usize {
        self.chunk_mut().len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_byte(op as u8);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let hi = ((jump >> 8) & 0xff) as u8;
        let lo = (jump & 0xff) as u8;
        self.chunk_mut().patch_byte(offset, hi);
        self.chunk_mut().patch_byte(offset + 1, lo);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop as u8);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        if self.compiler.ftype == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_byte(OpCode::Nil as u8);
        }
        self.emit_byte(OpCode::Return as u8);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk_mut().add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error("Too many constants in one function.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_bytes(OpCode::Const as u8, idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let obj = self.heap.intern_string(name);
        self.make_constant(Value::Obj(obj))
    }

    // --- scopes and variables -------------------------------------------

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        while let Some(local) = self.compiler.locals.last() {
            if local.depth <= self.compiler.scope_depth {
                break;
            }
            if local.is_captured {
                self.emit_byte(OpCode::CloseUpval as u8);
            } else {
                self.emit_byte(OpCode::Pop as u8);
            }
            self.compiler.locals.pop();
        }
    }

    fn add_local(&mut self, name: String) {
        let cap = (self.config.max_locals as usize).min(256);
        if self.compiler.locals.len() >= cap {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler.locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self, name: &str) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        for local in self.compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.compiler.scope_depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name.to_string());
    }

    fn parse_variable(&mut self, msg: &str) -> u8 {
        self.consume(TokenKind::Identifier, msg);
        let name = self.previous.lexeme.clone();
        self.declare_variable(&name);
        if self.compiler.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let depth = self.compiler.scope_depth;
        if let Some(local) = self.compiler.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefGlobal as u8, global);
    }

    fn resolve_local(&mut self, name: &str) -> Option<u8> {
        match find_local(&self.compiler, name) {
            Some((idx, true)) => {
                self.error("Can't read local variable in its own initializer.");
                Some(idx)
            }
            Some((idx, false)) => Some(idx),
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, name: &str) -> Option<u8> {
        match resolve_upvalue(&mut self.compiler, name) {
            Ok(v) => v,
            Err(msg) => {
                self.error(&msg);
                None
            }
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(name) {
            (OpCode::GetUpval, OpCode::SetUpval, slot)
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    // --- compiler context push/pop --------------------------------------

    fn push_compiler(&mut self, ftype: FunctionType, name: Option<*mut Obj>) {
        let function = self.heap.alloc_function(ObjFunction::new(name));
        let new_compiler = CompilerState::new(ftype, function);
        let old = std::mem::replace(&mut self.compiler, new_compiler);
        self.compiler.enclosing = Some(Box::new(old));
    }

    fn pop_compiler(&mut self) -> (*mut Obj, Vec<Upvalue>) {
        self.emit_return();
        if self.config.trace_bytecode {
            // Safety: the function's name, if any, was interned earlier in
            // this same compile and is still reachable through this root.
            let name = unsafe { self.compiler.function_mut().name_str() }
                .map(str::to_string)
                .unwrap_or_else(|| "<script>".to_string());
            disassemble_chunk(&name, &self.compiler.function_mut().chunk);
        }
        let function_ptr = self.compiler.function;
        let upvalue_count = self.compiler.upvalues.len();
        self.compiler.function_mut().upvalue_count = upvalue_count;
        let upvalues = std::mem::take(&mut self.compiler.upvalues);
        if let Some(enclosing) = self.compiler.enclosing.take() {
            self.compiler = *enclosing;
        }
        self.heap.pop_compiler_root();
        (function_ptr, upvalues)
    }

    // --- declarations and statements -------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Let) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Func) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil as u8);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, ftype: FunctionType) {
        let name = self.previous.lexeme.clone();
        let name_obj = self.heap.intern_string(&name);
        self.push_compiler(ftype, Some(name_obj));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.compiler.function_mut().arity;
                if arity >= 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.compiler.function_mut().arity = arity.saturating_add(1);
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function_ptr, upvalues) = self.pop_compiler();
        let const_idx = self.make_constant(Value::Obj(function_ptr));
        self.emit_bytes(OpCode::Closure as u8, const_idx);
        for uv in upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 });
            self.emit_byte(uv.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Func, "Expect 'func' before method name.");
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);
        let ftype = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(ftype);
        self.emit_bytes(OpCode::Method as u8, name_const);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&class_name);
        self.declare_variable(&class_name);
        self.emit_bytes(OpCode::Class as u8, name_const);
        self.define_variable(name_const);

        let class_compiler = ClassCompilerState { enclosing: self.current_class.take(), has_superclass: false };
        self.current_class = Some(Box::new(class_compiler));

        let mut opened_super_scope = false;
        if self.match_token(TokenKind::Extends) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.clone();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&super_name, false);

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit_byte(OpCode::Inherit as u8);
            if let Some(cc) = self.current_class.as_mut() {
                cc.has_superclass = true;
            }
            opened_super_scope = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop as u8);

        if opened_super_scope {
            self.end_scope();
        }
        self.current_class = self.current_class.take().and_then(|c| c.enclosing);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Match) {
            self.match_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop as u8);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::Jmpf);
        self.emit_byte(OpCode::Pop as u8);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jmp);
        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop as u8);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::Jmpf);
        self.emit_byte(OpCode::Pop as u8);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop as u8);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Let) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::Jmpf));
            self.emit_byte(OpCode::Pop as u8);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jmp);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_byte(OpCode::Pop as u8);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(ej) = exit_jump {
            self.patch_jump(ej);
            self.emit_byte(OpCode::Pop as u8);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compiler.ftype == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler.ftype == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return as u8);
        }
    }

    fn match_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'match'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after match expression.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before match body.");

        let mut end_jumps: Vec<usize> = Vec::new();
        let mut arm_count: u32 = 0;
        let mut seen_with = false;
        let mut seen_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if seen_default {
                self.error("No case may follow the default arm.");
            }
            if arm_count >= 256 {
                self.error("Too many match arms.");
            }
            if self.match_token(TokenKind::Underscore) {
                seen_default = true;
                self.consume(TokenKind::Arrow, "Expect '->' after '_'.");
                self.statement();
            } else {
                self.consume(TokenKind::With, "Expect 'with' or '_' to start a match arm.");
                seen_with = true;
                self.emit_byte(OpCode::Dup as u8);
                self.expression();
                self.consume(TokenKind::Arrow, "Expect '->' after match pattern.");
                self.emit_byte(OpCode::Equ as u8);
                let jmpf = self.emit_jump(OpCode::Jmpf);
                self.emit_byte(OpCode::Pop as u8);
                self.statement();
                end_jumps.push(self.emit_jump(OpCode::Jmp));
                self.patch_jump(jmpf);
                self.emit_byte(OpCode::Pop as u8);
            }
            arm_count += 1;
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after match body.");

        if !seen_with {
            self.error("A match statement needs at least one 'with' case.");
        }

        for j in end_jumps {
            self.patch_jump(j);
        }
        self.emit_byte(OpCode::Pop as u8);
    }

    // --- expressions ------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule(self.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.previous.kind).infix.expect("infix rule must exist for this token");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let n: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(n));
    }

    fn string_lit(&mut self, _can_assign: bool) {
        let lexeme = &self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let obj = self.heap.intern_string(content);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_byte(OpCode::False as u8),
            TokenKind::True => self.emit_byte(OpCode::True as u8),
            TokenKind::Nil => self.emit_byte(OpCode::Nil as u8),
            _ => unreachable!("literal() called for non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.current_class.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match &self.current_class {
            None => self.error("Can't use 'super' outside of a class."),
            Some(cc) if !cc.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_bytes(OpCode::InvokeSuper as u8, name_const);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_bytes(OpCode::GetSuper as u8, name_const);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_byte(OpCode::Negate as u8),
            TokenKind::Bang => self.emit_byte(OpCode::Not as u8),
            _ => unreachable!("unary() called for non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        let rule = get_rule(op);
        self.parse_precedence(rule.precedence.next());
        match op {
            TokenKind::Plus => self.emit_byte(OpCode::Add as u8),
            TokenKind::Minus => self.emit_byte(OpCode::Sub as u8),
            TokenKind::Star => self.emit_byte(OpCode::Mul as u8),
            TokenKind::Slash => self.emit_byte(OpCode::Div as u8),
            TokenKind::Percent => self.emit_byte(OpCode::Mod as u8),
            TokenKind::Caret => self.emit_byte(OpCode::Pow as u8),
            TokenKind::BangEqual => self.emit_byte(OpCode::NotEqu as u8),
            TokenKind::EqualEqual => self.emit_byte(OpCode::Equ as u8),
            TokenKind::Greater => self.emit_byte(OpCode::Gt as u8),
            TokenKind::GreaterEqual => self.emit_byte(OpCode::GtEqu as u8),
            TokenKind::Less => self.emit_byte(OpCode::Lt as u8),
            TokenKind::LessEqual => self.emit_byte(OpCode::LtEqu as u8),
            _ => unreachable!("binary() called for non-binary token"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::Jmpf);
        self.emit_byte(OpCode::Pop as u8);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::Jmpf);
        let end_jump = self.emit_jump(OpCode::Jmp);
        self.patch_jump(else_jump);
        self.emit_byte(OpCode::Pop as u8);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_bytes(OpCode::Call as u8, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count >= 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);

        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_bytes(OpCode::Invoke as u8, name_const);
            self.emit_byte(argc);
        } else if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProp as u8, name_const);
        } else {
            self.emit_bytes(OpCode::GetProp as u8, name_const);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBrack, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_byte(OpCode::StoreSub as u8);
        } else {
            self.emit_byte(OpCode::IndexSub as u8);
        }
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBrack) {
            loop {
                self.expression();
                if count >= 256 {
                    self.error("Can't have more than 256 list elements.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrack, "Expect ']' after list elements.");
        self.emit_bytes(OpCode::BuildList as u8, count as u8);
    }

    fn finish(mut self) -> *mut Obj {
        let (function_ptr, _) = self.pop_compiler();
        function_ptr
    }
}

/// Compile `source` into a root script `Function`, allocated through `heap`.
///
/// On success, the returned pointer is an `ObjFunction` with `arity == 0`
/// and `name == None`, ready to be wrapped in a `Closure` and called by the
/// VM. On failure, every distinct diagnostic collected across the compile
/// (after panic-mode resync suppressed merely-cascading ones) is returned.
///
/// `config.trace_bytecode` prints each function's disassembled chunk to
/// stderr right after it finishes compiling; `config.max_locals` caps how
/// many distinct locals/upvalues one function may declare (clamped to the
/// bytecode format's own 256 limit).
pub fn compile(source: &str, heap: &mut dyn Heap, config: &CompilerConfig) -> Result<*mut Obj, CompileErrors> {
    let mut parser = Parser::new(source, heap, config.clone());
    parser.advance();
    while !parser.check(TokenKind::Eof) {
        parser.declaration();
    }
    parser.consume(TokenKind::Eof, "Expect end of expression.");

    let had_error = parser.had_error;
    let errors = std::mem::take(&mut parser.errors);
    let function_ptr = parser.finish();

    if had_error {
        Err(CompileErrors(errors))
    } else {
        Ok(function_ptr)
    }
}

/// Dumps one function's disassembled chunk to stderr: offset, source line,
/// opcode, and any operand it carries. Unlike the VM's own per-instruction
/// trace, this walks the whole chunk statically, ahead of execution.
fn disassemble_chunk(name: &str, chunk: &Chunk) {
    eprintln!("== {name} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    let line = chunk.line_at(offset);
    let op = OpCode::from_u8(chunk.byte_at(offset));
    eprint!("{offset:04} (line {line:4}) {op:?}");
    let next = match op {
        OpCode::Const
        | OpCode::GetGlobal
        | OpCode::DefGlobal
        | OpCode::SetGlobal
        | OpCode::GetProp
        | OpCode::SetProp
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let idx = chunk.byte_at(offset + 1);
            eprint!(" {idx} '{:?}'", chunk.constant(idx));
            offset + 2
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpval | OpCode::SetUpval | OpCode::Call | OpCode::BuildList => {
            eprint!(" {}", chunk.byte_at(offset + 1));
            offset + 2
        }
        OpCode::Invoke | OpCode::InvokeSuper => {
            let idx = chunk.byte_at(offset + 1);
            let argc = chunk.byte_at(offset + 2);
            eprint!(" {idx} '{:?}' ({argc} args)", chunk.constant(idx));
            offset + 3
        }
        OpCode::Jmp | OpCode::Jmpf => {
            let jump = ((chunk.byte_at(offset + 1) as u16) << 8) | chunk.byte_at(offset + 2) as u16;
            eprint!(" -> {}", offset + 3 + jump as usize);
            offset + 3
        }
        OpCode::Loop => {
            let jump = ((chunk.byte_at(offset + 1) as u16) << 8) | chunk.byte_at(offset + 2) as u16;
            eprint!(" -> {}", offset + 3 - jump as usize);
            offset + 3
        }
        OpCode::Closure => {
            let idx = chunk.byte_at(offset + 1);
            let value = chunk.constant(idx);
            eprint!(" {idx} '{:?}'", value);
            let mut next = offset + 2;
            if let Value::Obj(ptr) = value {
                // Safety: a Closure's constant is the Function that just
                // finished compiling, still rooted by the caller.
                let upvalue_count = unsafe { (*ptr).as_function() }.map_or(0, |f| f.upvalue_count);
                for _ in 0..upvalue_count {
                    let is_local = chunk.byte_at(next);
                    let index = chunk.byte_at(next + 1);
                    let kind = if is_local != 0 { "local" } else { "upvalue" };
                    eprint!("\n{next:04}      | {kind} {index}");
                    next += 2;
                }
            }
            next
        }
        _ => offset + 1,
    };
    eprintln!();
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::{Obj, ObjData, ObjString, Table};

    /// Minimal, non-GC-collecting test heap: interning is correct, but
    /// objects are leaked deliberately, which is fine for a unit test that
    /// only inspects the compiled chunk and drops everything at the end.
    struct TestHeap {
        strings: Table,
        roots: Vec<*mut Obj>,
    }

    impl TestHeap {
        fn new() -> Self {
            TestHeap { strings: Table::new(), roots: Vec::new() }
        }
    }

    impl Heap for TestHeap {
        fn intern_string(&mut self, s: &str) -> *mut Obj {
            let hash = lumen_core::fnv1a_hash(s.as_bytes());
            if let Some(existing) = self.strings.find_string(s, hash) {
                return existing;
            }
            let obj = Box::into_raw(Box::new(Obj {
                marked: false,
                next: ptr::null_mut(),
                data: ObjData::String(ObjString::new(s)),
            }));
            self.strings.set(obj, Value::Bool(true));
            obj
        }

        fn alloc_function(&mut self, function: ObjFunction) -> *mut Obj {
            let obj = Box::into_raw(Box::new(Obj {
                marked: false,
                next: ptr::null_mut(),
                data: ObjData::Function(function),
            }));
            self.roots.push(obj);
            obj
        }

        fn pop_compiler_root(&mut self) {
            self.roots.pop();
        }
    }

    fn compile_ok(src: &str) -> *mut Obj {
        compile_ok_with(src, &CompilerConfig::default())
    }

    fn compile_ok_with(src: &str, config: &CompilerConfig) -> *mut Obj {
        let mut heap = TestHeap::new();
        match compile(src, &mut heap, config) {
            Ok(f) => f,
            Err(e) => panic!("unexpected compile error: {:?}", e.errors()),
        }
    }

    fn compile_err(src: &str) -> CompileErrors {
        compile_err_with(src, &CompilerConfig::default())
    }

    fn compile_err_with(src: &str, config: &CompilerConfig) -> CompileErrors {
        let mut heap = TestHeap::new();
        match compile(src, &mut heap, config) {
            Ok(_) => panic!("expected compile error for: {src}"),
            Err(e) => e,
        }
    }

    #[test]
    fn compiles_trivial_script_ending_in_return_nil() {
        let f = compile_ok("let x = 1;");
        let function = unsafe { (*f).as_function().unwrap() };
        let code = function.chunk.code();
        assert_eq!(code.last().copied(), Some(OpCode::Return as u8));
    }

    #[test]
    fn arithmetic_precedence_emits_factor_before_term() {
        let f = compile_ok("let x = 1 + 2 * 3;");
        let function = unsafe { (*f).as_function().unwrap() };
        let code = function.chunk.code();
        // CONST 1, CONST 2, CONST 3, MUL, ADD, DEF_GLOBAL ... RETURN
        let mul_pos = code.iter().position(|&b| b == OpCode::Mul as u8).unwrap();
        let add_pos = code.iter().position(|&b| b == OpCode::Add as u8).unwrap();
        assert!(mul_pos < add_pos);
    }

    #[test]
    fn return_at_script_scope_is_a_compile_error() {
        let errs = compile_err("return 1;");
        assert!(errs.errors().iter().any(|e| e.message.contains("top-level")));
    }

    #[test]
    fn self_reference_in_initializer_is_rejected() {
        let errs = compile_err("func f() { let x = x; }");
        assert!(errs.errors().iter().any(|e| e.message.contains("own initializer")));
    }

    #[test]
    fn class_inheriting_from_itself_is_a_compile_error() {
        let errs = compile_err("class A extends A { }");
        assert!(errs.errors().iter().any(|e| e.message.contains("inherit from itself")));
    }

    #[test]
    fn empty_match_is_a_compile_error() {
        let errs = compile_err("func f(x) { match (x) { } }");
        assert!(errs.errors().iter().any(|e| e.message.contains("match")));
    }

    #[test]
    fn default_only_match_is_a_compile_error() {
        let errs = compile_err("func f(x) { match (x) { _ -> return 1; } }");
        assert!(errs.errors().iter().any(|e| e.message.contains("match")));
    }

    #[test]
    fn closure_emits_binding_bytes_per_upvalue() {
        let f = compile_ok("func outer() { let i = 0; func inner() { return i; } return inner; }");
        let function = unsafe { (*f).as_function().unwrap() };
        // outer's own chunk should contain one CLOSURE for `inner` with 1 upvalue pair.
        let code = function.chunk.code();
        let closure_pos = code.iter().position(|&b| b == OpCode::Closure as u8).unwrap();
        // CLOSURE, const-idx, is_local, index
        assert_eq!(code[closure_pos + 2], 1); // captured as local of `outer`
    }

    #[test]
    fn too_many_constants_is_a_compile_error() {
        let mut src = String::new();
        for i in 0..300 {
            src.push_str(&format!("let v{i} = {i};\n"));
        }
        let errs = compile_err(&src);
        assert!(errs.errors().iter().any(|e| e.message.contains("Too many constants")));
    }

    #[test]
    fn max_locals_config_lowers_the_local_cap() {
        let mut src = String::from("func f() {\n");
        for i in 0..10 {
            src.push_str(&format!("    let v{i} = {i};\n"));
        }
        src.push_str("}\n");

        compile_ok_with(&src, &CompilerConfig::default());

        let config = CompilerConfig { trace_bytecode: false, max_locals: 5 };
        let errs = compile_err_with(&src, &config);
        assert!(errs.errors().iter().any(|e| e.message.contains("Too many local variables")));
    }

    #[test]
    fn max_locals_config_cannot_exceed_the_bytecode_format_cap() {
        // A config asking for more than 256 locals is clamped, not honored;
        // the one-byte GetLocal/SetLocal operand can't address past 255.
        let config = CompilerConfig { trace_bytecode: false, max_locals: 1000 };
        let mut src = String::from("func f() {\n");
        for i in 0..257 {
            src.push_str(&format!("    let v{i} = {i};\n"));
        }
        src.push_str("}\n");
        let errs = compile_err_with(&src, &config);
        assert!(errs.errors().iter().any(|e| e.message.contains("Too many local variables")));
    }
}
