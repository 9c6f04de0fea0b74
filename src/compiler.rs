use std::rc::Rc;

use super::chunk::{Chunk, OpCode};
use super::reporter::{Phase, Report, Reporter};
use super::table::Interner;
use super::token::{Token, TokenType};
use super::tokenizer::Tokenizer;
use super::value::{LoxFunction, Object, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_LOOP_DEPTH: usize = 16;
const MAX_ARGS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn<'a> = fn(&mut Compiler<'a>, bool);

struct Rule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

fn get_rule<'a>(typ: TokenType) -> Rule<'a> {
    use TokenType::*;
    match typ {
        LeftParen => Rule { prefix: Some(Compiler::grouping), infix: Some(Compiler::call), precedence: Precedence::Call },
        Minus => Rule { prefix: Some(Compiler::unary), infix: Some(Compiler::binary), precedence: Precedence::Term },
        Plus => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Term },
        Slash => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Star => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Bang => Rule { prefix: Some(Compiler::unary), infix: None, precedence: Precedence::None },
        BangEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        EqualEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        Greater => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        GreaterEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Less => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        LessEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Identifier => Rule { prefix: Some(Compiler::variable), infix: None, precedence: Precedence::None },
        String => Rule { prefix: Some(Compiler::string), infix: None, precedence: Precedence::None },
        Number => Rule { prefix: Some(Compiler::number), infix: None, precedence: Precedence::None },
        And => Rule { prefix: None, infix: Some(Compiler::and_), precedence: Precedence::And },
        Or => Rule { prefix: None, infix: Some(Compiler::or_), precedence: Precedence::Or },
        QuestionMark => Rule { prefix: None, infix: Some(Compiler::ternary), precedence: Precedence::Ternary },
        False | True | Nil => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        _ => Rule { prefix: None, infix: None, precedence: Precedence::None },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
}

#[derive(Debug, Clone, Copy)]
struct Local<'a> {
    name: &'a str,
    depth: i32,
    is_captured: bool,
    is_const: bool,
}

#[derive(Debug, Clone, Copy)]
struct UpvalueRef {
    is_local: bool,
    index: u8,
}

#[derive(Debug, Clone)]
struct LoopCtx {
    continue_addr: usize,
    break_jumps: Vec<usize>,
    scope_depth_at_start: u32,
}

struct FunctionState<'a> {
    typ: FunctionType,
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'a>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: u32,
    loops: Vec<LoopCtx>,
}

impl<'a> FunctionState<'a> {
    fn new(typ: FunctionType, name: Option<String>) -> Self {
        // Slot 0 always holds the running closure itself; see the VM's
        // call protocol. It is never resolved by name.
        FunctionState {
            typ,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local { name: "", depth: 0, is_captured: false, is_const: true }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

/// Single-pass Pratt parser that emits bytecode directly into a `Chunk`
/// as it recognizes each construct — there is no intermediate AST.
/// Lexical scoping (locals/upvalues/globals) and loop bookkeeping are
/// tracked per enclosing function in a stack of `FunctionState`s; the
/// top of that stack is always the function currently being compiled.
pub struct Compiler<'a> {
    tokenizer: Tokenizer<'a>,
    previous: Token<'a>,
    current: Token<'a>,
    reporter: &'a mut dyn Reporter,
    interner: &'a mut Interner,
    had_error: bool,
    panic_mode: bool,
    functions: Vec<FunctionState<'a>>,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str, interner: &'a mut Interner, reporter: &'a mut dyn Reporter) -> Self {
        let tokenizer = Tokenizer::new(source);
        let placeholder = Token::new(TokenType::Eof, "", 0);
        let mut compiler = Compiler {
            tokenizer,
            previous: placeholder,
            current: placeholder,
            reporter,
            interner,
            had_error: false,
            panic_mode: false,
            functions: Vec::new(),
        };
        compiler.functions.push(FunctionState::new(FunctionType::Script, None));
        compiler
    }

    // --- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.tokenizer.next_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if !self.check(typ) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, typ: TokenType, message: &str) {
        if self.check(typ) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // --- diagnostics ---------------------------------------------------

    fn error_at(&mut self, token: Token<'a>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let text = match token.typ {
            TokenType::Eof => format!("Error at end: {}", message),
            TokenType::Error => format!("Error: {}", message),
            _ => format!("Error at '{}': {}", token.lexeme, message),
        };
        self.reporter.error(Report::new(Phase::Compiling, text, token.line));
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.typ != TokenType::Eof {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            match self.current.typ {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::Const
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- function stack -------------------------------------------------

    fn current_fn(&self) -> &FunctionState<'a> {
        self.functions.last().unwrap()
    }

    fn current_fn_mut(&mut self) -> &mut FunctionState<'a> {
        self.functions.last_mut().unwrap()
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_fn_mut().chunk
    }

    fn push_function(&mut self, typ: FunctionType, name: Option<String>) {
        self.functions.push(FunctionState::new(typ, name));
    }

    /// Pops the innermost function, emitting its implicit `nil; return`
    /// first, and hands back the compiled function plus the upvalue
    /// descriptors the *caller* (the now-current, enclosing function)
    /// needs to emit alongside `OP_CLOSURE`.
    fn pop_function(&mut self) -> (LoxFunction, Vec<UpvalueRef>) {
        self.emit_return();
        let state = self.functions.pop().unwrap();
        #[cfg(feature = "debug-bytecode")]
        {
            let label = state.name.clone().unwrap_or_else(|| "script".to_string());
            eprint!("{}", state.chunk.disassemble(&label));
        }
        let function = LoxFunction {
            name: state.name.map(|n| self.interner.intern(&n)),
            arity: state.arity,
            upvalue_count: state.upvalues.len(),
            chunk: state.chunk,
        };
        (function, state.upvalues)
    }

    // --- bytecode emission ----------------------------------------------

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.current_chunk().write_u8(byte, line);
    }

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.current_chunk().write_op(op, line);
    }

    fn emit_u32(&mut self, word: u32, line: u32) {
        self.current_chunk().write_u32(word, line);
    }

    fn emit_return(&mut self) {
        let line = self.previous.line;
        self.emit_op(OpCode::Nil, line);
        self.emit_op(OpCode::Return, line);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        let index = self.current_chunk().add_constant(value);
        self.emit_indexed(OpCode::Const, OpCode::ConstLong, index, line);
    }

    /// Picks the short (`u8`) or `_LONG` (`u32`) form of an indexed
    /// instruction depending on whether `index` fits in a byte.
    fn emit_indexed(&mut self, short: OpCode, long: OpCode, index: usize, line: u32) {
        if index <= u8::MAX as usize {
            self.emit_op(short, line);
            self.emit_byte(index as u8, line);
        } else {
            self.emit_op(long, line);
            self.emit_u32(index as u32, line);
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.current_chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if self.current_chunk().patch_jump(offset).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if self.current_chunk().emit_loop(OpCode::Jump, loop_start, line).is_err() {
            self.error("Loop body too large.");
        }
    }

    fn emit_closure(&mut self, function: LoxFunction, upvalues: Vec<UpvalueRef>) {
        let line = self.previous.line;
        let index = self.current_chunk().add_constant(Value::Object(Object::Function(Rc::new(function))));
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
        }
        self.emit_op(OpCode::Closure, line);
        self.emit_byte(index as u8, line);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8, line);
            self.emit_byte(upvalue.index, line);
        }
    }

    // --- scopes, locals, upvalues ----------------------------------------

    fn begin_scope(&mut self) {
        self.current_fn_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let line = self.previous.line;
        self.current_fn_mut().scope_depth -= 1;
        let depth = self.current_fn().scope_depth as i32;
        while let Some(local) = self.current_fn().locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
            self.current_fn_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'a str, is_const: bool) {
        if self.current_fn().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_fn_mut().locals.push(Local { name, depth: -1, is_captured: false, is_const });
    }

    fn declare_variable(&mut self, name: Token<'a>, is_const: bool) {
        let scope_depth = self.current_fn().scope_depth;
        for local in self.current_fn().locals.iter().rev() {
            if local.depth != -1 && (local.depth as u32) < scope_depth {
                break;
            }
            if local.name == name.lexeme {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name.lexeme, is_const);
    }

    fn mark_initialized(&mut self) {
        let depth = self.current_fn().scope_depth;
        if depth == 0 {
            return;
        }
        self.current_fn_mut().locals.last_mut().unwrap().depth = depth as i32;
    }

    fn resolve_local(&mut self, fn_idx: usize, name: &str) -> Option<(usize, bool)> {
        for (i, local) in self.functions[fn_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some((i, local.is_const));
            }
        }
        None
    }

    fn add_upvalue(&mut self, fn_idx: usize, is_local: bool, index: u8) -> usize {
        let upvalues = &mut self.functions[fn_idx].upvalues;
        if let Some(pos) = upvalues.iter().position(|u| u.is_local == is_local && u.index == index) {
            return pos;
        }
        if upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.functions[fn_idx].upvalues.push(UpvalueRef { is_local, index });
        self.functions[fn_idx].upvalues.len() - 1
    }

    fn resolve_upvalue(&mut self, fn_idx: usize, name: &str) -> Option<usize> {
        if fn_idx == 0 {
            return None;
        }
        let enclosing = fn_idx - 1;
        if let Some((local_idx, _)) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local_idx].is_captured = true;
            return Some(self.add_upvalue(fn_idx, true, local_idx as u8));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(fn_idx, false, up_idx as u8));
        }
        None
    }

    fn identifier_constant(&mut self, name: Token<'a>) -> usize {
        let interned = self.interner.intern(name.lexeme);
        self.current_chunk().add_constant(Value::from(interned))
    }

    fn named_variable(&mut self, name: Token<'a>, can_assign: bool) {
        let line = name.line;
        let fn_idx = self.functions.len() - 1;
        enum Kind {
            Local,
            Upvalue,
            Global,
        }
        let (kind, index, is_const) = if let Some((idx, is_const)) = self.resolve_local(fn_idx, name.lexeme) {
            (Kind::Local, idx, is_const)
        } else if let Some(idx) = self.resolve_upvalue(fn_idx, name.lexeme) {
            (Kind::Upvalue, idx, false)
        } else {
            let idx = self.identifier_constant(name);
            (Kind::Global, idx, false)
        };

        let assigning = can_assign && self.matches(TokenType::Equal);
        if assigning {
            if is_const {
                self.error("Can't assign to a const variable.");
            }
            self.expression();
        }

        match kind {
            Kind::Local => {
                let (short, long) = (OpCode::GetLocal, OpCode::GetLocalLong);
                let (short_set, long_set) = (OpCode::SetLocal, OpCode::SetLocalLong);
                if assigning {
                    self.emit_indexed(short_set, long_set, index, line);
                } else {
                    self.emit_indexed(short, long, index, line);
                }
            }
            Kind::Upvalue => {
                if assigning {
                    self.emit_indexed(OpCode::SetUpvalue, OpCode::SetUpvalueLong, index, line);
                } else {
                    self.emit_indexed(OpCode::GetUpvalue, OpCode::GetUpvalueLong, index, line);
                }
            }
            Kind::Global => {
                if assigning {
                    self.emit_indexed(OpCode::SetGlobal, OpCode::SetGlobalLong, index, line);
                } else {
                    self.emit_indexed(OpCode::GetGlobal, OpCode::GetGlobalLong, index, line);
                }
            }
        }
    }

    // --- loops ------------------------------------------------------------

    fn push_loop(&mut self, continue_addr: usize) {
        if self.current_fn().loops.len() >= MAX_LOOP_DEPTH {
            self.error("Loops nested too deeply.");
        }
        let scope_depth_at_start = self.current_fn().scope_depth;
        self.current_fn_mut().loops.push(LoopCtx { continue_addr, break_jumps: Vec::new(), scope_depth_at_start });
    }

    fn pop_loop_and_patch_breaks(&mut self) {
        let loop_ctx = self.current_fn_mut().loops.pop().unwrap();
        for offset in loop_ctx.break_jumps {
            self.patch_jump(offset);
        }
    }

    fn loop_at_level(&self, levels: usize) -> Option<usize> {
        let loops = &self.current_fn().loops;
        if levels == 0 || levels > loops.len() {
            None
        } else {
            Some(loops.len() - levels)
        }
    }

    /// Emits the `CLOSE_UPVALUE`/`POP` sequence for every local opened
    /// since `loop_idx`'s enclosing scope started, without touching the
    /// compiler's own locals bookkeeping (parsing continues afterwards).
    fn emit_scope_cleanup_for_loop(&mut self, loop_idx: usize) {
        let line = self.previous.line;
        let target_depth = self.current_fn().loops[loop_idx].scope_depth_at_start as i32;
        let locals_len = self.current_fn().locals.len();
        for i in (0..locals_len).rev() {
            if self.current_fn().locals[i].depth <= target_depth {
                break;
            }
            if self.current_fn().locals[i].is_captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
        }
    }

    fn parse_loop_target_count(&mut self) -> usize {
        if self.check(TokenType::Number) {
            let lexeme = self.current.lexeme;
            self.advance();
            lexeme.parse::<usize>().unwrap_or(1).max(1)
        } else {
            1
        }
    }

    // --- expressions --------------------------------------------------------

    fn parse_precedence(&mut self, min_prec: Precedence) {
        self.advance();
        let prefix = get_rule(self.previous.typ).prefix;
        let can_assign = min_prec <= Precedence::Assignment;
        match prefix {
            Some(prefix_fn) => prefix_fn(self, can_assign),
            None => {
                self.error("Expect expression.");
                return;
            }
        }

        while min_prec <= get_rule(self.current.typ).precedence {
            self.advance();
            let infix = get_rule(self.previous.typ).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.typ;
        let line = self.previous.line;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Minus => self.emit_op(OpCode::Negate, line),
            TokenType::Bang => self.emit_op(OpCode::Not, line),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.typ;
        let line = self.previous.line;
        let precedence = get_rule(operator).precedence;
        self.parse_precedence(precedence.next());
        match operator {
            TokenType::Plus => self.emit_op(OpCode::Add, line),
            TokenType::Minus => self.emit_op(OpCode::Sub, line),
            TokenType::Star => self.emit_op(OpCode::Mul, line),
            TokenType::Slash => self.emit_op(OpCode::Div, line),
            TokenType::EqualEqual => self.emit_op(OpCode::Equal, line),
            TokenType::BangEqual => {
                self.emit_op(OpCode::Equal, line);
                self.emit_op(OpCode::Not, line);
            }
            TokenType::Greater => self.emit_op(OpCode::Greater, line),
            TokenType::GreaterEqual => {
                self.emit_op(OpCode::Less, line);
                self.emit_op(OpCode::Not, line);
            }
            TokenType::Less => self.emit_op(OpCode::Less, line),
            TokenType::LessEqual => {
                self.emit_op(OpCode::Greater, line);
                self.emit_op(OpCode::Not, line);
            }
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop, self.previous.line);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop, self.previous.line);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self, _can_assign: bool) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop, self.previous.line);
        self.parse_precedence(Precedence::Ternary);
        self.consume(TokenType::Colon, "Expect ':' after then-branch of ternary.");
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop, self.previous.line);
        self.parse_precedence(Precedence::Assignment);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let line = self.previous.line;
        let argc = self.argument_list();
        self.emit_op(OpCode::Call, line);
        self.emit_byte(argc, line);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn literal(&mut self, _can_assign: bool) {
        let line = self.previous.line;
        match self.previous.typ {
            TokenType::False => self.emit_op(OpCode::False, line),
            TokenType::True => self.emit_op(OpCode::True, line),
            TokenType::Nil => self.emit_op(OpCode::Nil, line),
            _ => unreachable!(),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().expect("scanner only produces valid numeric lexemes");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let raw = self.previous.lexeme;
        let content = &raw[1..raw.len() - 1];
        let interned = self.interner.intern(content);
        self.emit_constant(Value::from(interned));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    // --- statements ---------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenType::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenType::Const) {
            self.var_declaration(true);
        } else if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    /// A statement inside a `switch` case/default body. Case bodies admit
    /// only statements, not declarations: a `var`/`const`/`fun` there would
    /// add a compiler-tracked local that `end_scope` unconditionally emits
    /// cleanup for, even on a run where the case itself never executed and
    /// so never pushed anything for that cleanup to pop.
    fn case_statement(&mut self) {
        if self.check(TokenType::Var) || self.check(TokenType::Const) || self.check(TokenType::Fun) {
            self.error_at_current("Expect statement.");
            self.advance();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, is_const: bool) {
        self.consume(TokenType::Identifier, "Expect variable name.");
        let name = self.previous;
        let is_local = self.current_fn().scope_depth > 0;
        let global_index = if is_local {
            self.declare_variable(name, is_const);
            None
        } else {
            if is_const {
                self.error("Const variables are not allowed at global scope.");
            }
            Some(self.identifier_constant(name))
        };

        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            if is_const {
                self.error("Const variable must have an initializer.");
            }
            self.emit_op(OpCode::Nil, self.previous.line);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");

        if is_local {
            self.mark_initialized();
        } else {
            let line = self.previous.line;
            self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global_index.unwrap(), line);
        }
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect function name.");
        let name = self.previous;
        let is_local = self.current_fn().scope_depth > 0;
        let global_index = if is_local {
            self.declare_variable(name, false);
            self.mark_initialized();
            None
        } else {
            Some(self.identifier_constant(name))
        };

        self.function(name.lexeme);

        if !is_local {
            let line = self.previous.line;
            self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global_index.unwrap(), line);
        }
    }

    fn function(&mut self, name: &str) {
        self.push_function(FunctionType::Function, Some(name.to_string()));
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                self.current_fn_mut().arity += 1;
                if self.current_fn().arity as usize > MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.consume(TokenType::Identifier, "Expect parameter name.");
                let param = self.previous;
                self.declare_variable(param, false);
                self.mark_initialized();
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.pop_function();
        self.emit_closure(function, upvalues);
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn statement(&mut self) {
        if self.matches(TokenType::Print) {
            self.print_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::Switch) {
            self.switch_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::Break) {
            self.break_statement();
        } else if self.matches(TokenType::Continue) {
            self.continue_statement();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print, self.previous.line);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop, self.previous.line);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop, self.previous.line);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop, self.previous.line);

        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop, self.previous.line);

        self.push_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop, self.previous.line);
        self.pop_loop_and_patch_breaks();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenType::Const) {
            self.var_declaration(true);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop, self.previous.line);
        }

        if !self.check(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop, self.previous.line);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
        }

        self.push_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop, self.previous.line);
        }
        self.pop_loop_and_patch_breaks();

        self.end_scope();
    }

    fn switch_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'switch'.");
        self.begin_scope();
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after switch expression.");

        let depth = self.current_fn().scope_depth as i32;
        self.current_fn_mut().locals.push(Local { name: "", depth, is_captured: false, is_const: true });
        let hidden_slot = self.current_fn().locals.len() - 1;

        self.consume(TokenType::LeftBrace, "Expect '{' before switch body.");

        let mut end_jumps = Vec::new();
        let mut seen_default = false;
        let mut pending_fallthrough: Option<usize> = None;

        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if let Some(offset) = pending_fallthrough.take() {
                self.patch_jump(offset);
                self.emit_op(OpCode::Pop, self.previous.line);
            }

            if self.matches(TokenType::Case) {
                if seen_default {
                    self.error("Can't have a case after the default case.");
                }
                let line = self.previous.line;
                self.emit_indexed(OpCode::GetLocal, OpCode::GetLocalLong, hidden_slot, line);
                self.parse_precedence(Precedence::Unary);
                self.consume(TokenType::Colon, "Expect ':' after case value.");
                self.emit_op(OpCode::Equal, self.previous.line);

                let next_case = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop, self.previous.line);

                while !self.check(TokenType::Case)
                    && !self.check(TokenType::Default)
                    && !self.check(TokenType::RightBrace)
                    && !self.check(TokenType::Eof)
                {
                    self.case_statement();
                }

                end_jumps.push(self.emit_jump(OpCode::Jump));
                pending_fallthrough = Some(next_case);
            } else if self.matches(TokenType::Default) {
                if seen_default {
                    self.error("Can't have more than one default case.");
                }
                seen_default = true;
                self.consume(TokenType::Colon, "Expect ':' after 'default'.");

                while !self.check(TokenType::Case)
                    && !self.check(TokenType::Default)
                    && !self.check(TokenType::RightBrace)
                    && !self.check(TokenType::Eof)
                {
                    self.case_statement();
                }
            } else {
                self.error_at_current("Expect 'case' or 'default'.");
                self.advance();
            }
        }

        if let Some(offset) = pending_fallthrough.take() {
            self.patch_jump(offset);
            self.emit_op(OpCode::Pop, self.previous.line);
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }

        self.consume(TokenType::RightBrace, "Expect '}' after switch body.");
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current_fn().typ == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return, self.previous.line);
        }
    }

    fn break_statement(&mut self) {
        let levels = self.parse_loop_target_count();
        self.consume(TokenType::Semicolon, "Expect ';' after 'break'.");
        match self.loop_at_level(levels) {
            Some(idx) => {
                self.emit_scope_cleanup_for_loop(idx);
                let jump = self.emit_jump(OpCode::Jump);
                self.current_fn_mut().loops[idx].break_jumps.push(jump);
            }
            None => self.error("Can't use 'break' outside of a loop."),
        }
    }

    fn continue_statement(&mut self) {
        let levels = self.parse_loop_target_count();
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.");
        match self.loop_at_level(levels) {
            Some(idx) => {
                self.emit_scope_cleanup_for_loop(idx);
                let continue_addr = self.current_fn().loops[idx].continue_addr;
                self.emit_loop(continue_addr);
            }
            None => self.error("Can't use 'continue' outside of a loop."),
        }
    }
}

/// Compiles `source` into a top-level script function, or `None` if any
/// compile error was reported. The entire file is still parsed even
/// after the first error (panic-mode recovery via `synchronize`), so a
/// single run surfaces every diagnostic it can.
pub fn compile(source: &str, interner: &mut Interner, reporter: &mut dyn Reporter) -> Option<Rc<LoxFunction>> {
    let mut compiler = Compiler::new(source, interner, reporter);
    compiler.advance();
    while !compiler.check(TokenType::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenType::Eof, "Expect end of expression.");

    let had_error = compiler.had_error;
    let (function, _upvalues) = compiler.pop_function();
    if had_error {
        None
    } else {
        Some(Rc::new(function))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;
    use crate::reporter::CapturingReporter;

    fn compile_ok(source: &str) -> Rc<LoxFunction> {
        let mut interner = Interner::new();
        let mut reporter = CapturingReporter::default();
        let function = compile(source, &mut interner, &mut reporter);
        assert!(reporter.errors.is_empty(), "unexpected errors: {:?}", reporter.errors.iter().map(|r| r.to_string()).collect::<Vec<_>>());
        function.expect("compile should have succeeded")
    }

    fn compile_err(source: &str) -> Vec<String> {
        let mut interner = Interner::new();
        let mut reporter = CapturingReporter::default();
        let function = compile(source, &mut interner, &mut reporter);
        assert!(function.is_none());
        reporter.errors.iter().map(|r| r.message.clone()).collect()
    }

    #[test]
    fn arithmetic_precedence_emits_expected_opcodes() {
        let function = compile_ok("1 + 2 * 3;");
        let dump = function.chunk.disassemble("script");
        assert!(dump.contains("CONST"));
        assert!(dump.contains("MUL"));
        assert!(dump.contains("ADD"));
    }

    #[test]
    fn global_declaration_emits_define_global() {
        let function = compile_ok("var x = 1;");
        let dump = function.chunk.disassemble("script");
        assert!(dump.contains("DEFINE_GLOBAL"));
    }

    #[test]
    fn local_self_reference_in_initializer_is_an_error() {
        let errors = compile_err("{ var a = a; }");
        assert!(errors.iter().any(|m| m.contains("own initializer")));
    }

    #[test]
    fn duplicate_local_in_same_scope_is_an_error() {
        let errors = compile_err("{ var a = 1; var a = 2; }");
        assert!(errors.iter().any(|m| m.contains("Already a variable")));
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        let errors = compile_err("return 1;");
        assert!(errors.iter().any(|m| m.contains("top-level")));
    }

    #[test]
    fn assigning_to_const_local_is_an_error() {
        let errors = compile_err("{ const a = 1; a = 2; }");
        assert!(errors.iter().any(|m| m.contains("const")));
    }

    #[test]
    fn const_at_global_scope_is_an_error() {
        let errors = compile_err("const a = 1;");
        assert!(errors.iter().any(|m| m.contains("global scope")));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let errors = compile_err("break;");
        assert!(errors.iter().any(|m| m.contains("outside of a loop")));
    }

    #[test]
    fn function_emits_closure_instruction() {
        let function = compile_ok("fun f() { return 1; } f();");
        let dump = function.chunk.disassemble("script");
        assert!(dump.contains("CLOSURE"));
        assert!(dump.contains("CALL"));
    }

    #[test]
    fn nested_closure_captures_enclosing_local() {
        let function = compile_ok("fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; }");
        let dump = function.chunk.disassemble("script");
        assert!(dump.contains("local 0"));
    }

    #[test]
    fn jump_out_of_range_is_rejected() {
        let mut source = String::from("if (true) {");
        for i in 0..20000 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push_str("}");
        let errors = compile_err(&source);
        assert!(errors.iter().any(|m| m.contains("Too much code")));
    }

    #[test]
    fn ternary_desugars_with_balanced_stack_effect() {
        let function = compile_ok("var x = true ? 1 : 2;");
        let dump = function.chunk.disassemble("script");
        assert!(dump.contains("JUMP_IF_FALSE"));
        assert!(dump.contains("JUMP "));
    }

    #[test]
    fn switch_without_default_compiles() {
        compile_ok("switch (1) { case 1: print 1; case 2: print 2; }");
    }

    #[test]
    fn default_after_case_is_required_to_be_last() {
        let errors = compile_err("switch (1) { default: print 1; case 2: print 2; }");
        assert!(errors.iter().any(|m| m.contains("after the default")));
    }

    #[test]
    fn bare_declaration_in_case_body_is_an_error() {
        let errors = compile_err("switch (1) { case 1: var a = 1; }");
        assert!(errors.iter().any(|m| m.contains("Expect statement")));
    }

    #[test]
    fn opcode_from_u8_round_trips_every_variant() {
        for byte in 0..=36u8 {
            let op = OpCode::from_u8(byte);
            assert_eq!(op as u8, byte);
        }
    }
}
