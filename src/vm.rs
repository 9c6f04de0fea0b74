use std::rc::Rc;

use super::chunk::{Chunk, OpCode};
use super::natives::native_registry;
use super::reporter::{Phase, Report, Reporter};
use super::table::{Interner, Table};
use super::value::{Arity, Closure, Object, Upvalue, UpvalueState, Value};

const FRAMES_MAX: usize = 256;

struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    base: usize,
}

impl CallFrame {
    fn chunk(&self) -> &Chunk {
        &self.closure.function.chunk
    }
}

/// Outcome of a full program run, distinguishing how it stopped so the
/// CLI can choose an exit code without the VM knowing about process
/// exit codes itself.
pub enum RunResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Stack-based bytecode interpreter. A single `Vm` is reused across an
/// entire REPL session so that globals and interned strings persist
/// between entries; `interpret` can be called repeatedly.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    interner: Interner,
    open_upvalues: Vec<Rc<Upvalue>>,
}

impl Vm {
    pub fn new() -> Self {
        let mut interner = Interner::new();
        let mut globals = Table::new();
        for native in native_registry() {
            let name = interner.intern(native.name);
            globals.set(Value::from(name), Value::from(Rc::new(native)));
        }
        Vm {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            globals,
            interner,
            open_upvalues: Vec::new(),
        }
    }

    pub fn interpret(&mut self, source: &str, reporter: &mut dyn Reporter) -> RunResult {
        let function = match super::compiler::compile(source, &mut self.interner, reporter) {
            Some(function) => function,
            None => return RunResult::CompileError,
        };

        let closure = Rc::new(Closure { function, upvalues: Vec::new() });
        self.stack.push(Value::from(closure.clone()));
        self.frames.push(CallFrame { closure, ip: 0, base: 0 });

        match self.run(reporter) {
            Ok(()) => RunResult::Ok,
            Err(()) => RunResult::RuntimeError,
        }
    }

    // --- stack helpers ------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler emitted an unbalanced instruction sequence")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk().read_u8(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u32(&mut self) -> u32 {
        let frame = self.frame_mut();
        let word = frame.chunk().read_u32(frame.ip);
        frame.ip += 4;
        word
    }

    fn read_i16(&mut self) -> i16 {
        let frame = self.frame_mut();
        let value = frame.chunk().read_i16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_index(&mut self, long: bool) -> usize {
        if long {
            self.read_u32() as usize
        } else {
            self.read_u8() as usize
        }
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let index = self.read_index(long);
        self.frame().chunk().constant(index).clone()
    }

    // --- runtime errors --------------------------------------------------

    /// Builds the stack trace for a runtime failure: the message
    /// followed by one `[line N] in NAME()` row per active frame, from
    /// innermost outward, ending at `in script` for the top-level frame.
    fn runtime_error(&mut self, reporter: &mut dyn Reporter, message: String) {
        let mut text = format!("RuntimeError: {}.", message);
        for frame in self.frames.iter().rev() {
            let line = frame.chunk().line_for_offset(frame.ip.saturating_sub(1));
            let location = match &frame.closure.function.name {
                Some(name) => format!("in {}()", name.chars),
                None => "in script".to_string(),
            };
            text += &format!("\n[line {}] {}", line, location);
        }
        let line = self.frames.last().map(|f| f.chunk().line_for_offset(f.ip.saturating_sub(1))).unwrap_or(0);
        reporter.error(Report::new(Phase::Runtime, text, line));
    }

    // --- calling ------------------------------------------------------

    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> Result<(), String> {
        let arity = closure.function.arity as usize;
        if argc != arity {
            return Err(format!("Expected {} arguments but got {}", arity, argc));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err("Stack overflow".to_string());
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure, ip: 0, base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        if let Some(closure) = callee.as_closure() {
            return self.call_closure(closure.clone(), argc);
        }
        if let Some(native) = callee.as_native() {
            let ok_arity = match native.arity {
                Arity::Fixed(n) => n as usize == argc,
                Arity::Variadic => true,
            };
            if !ok_arity {
                let expected = match native.arity {
                    Arity::Fixed(n) => n.to_string(),
                    Arity::Variadic => "any number of".to_string(),
                };
                return Err(format!("Expected {} arguments but got {}", expected, argc));
            }
            let start = self.stack.len() - argc;
            let args: Vec<Value> = self.stack[start..].to_vec();
            self.stack.truncate(start - 1);
            let result = (native.func)(&args, &mut self.interner);
            match result {
                Ok(value) => {
                    self.push(value);
                    Ok(())
                }
                Err(message) => Err(format!("Call to native function '{}' failed: {}", native.name, message)),
            }
        } else {
            Err("Can only call functions".to_string())
        }
    }

    // --- upvalues -------------------------------------------------------

    /// Returns the open upvalue for `stack_slot`, creating it if none
    /// exists yet. The open list is kept sorted in strictly-descending
    /// slot order (largest slot first), which is what makes
    /// `close_upvalues` a simple prefix scan from the front.
    fn capture_upvalue(&mut self, stack_slot: usize) -> Rc<Upvalue> {
        let mut insert_at = self.open_upvalues.len();
        for (i, upvalue) in self.open_upvalues.iter().enumerate() {
            match *upvalue.0.borrow() {
                UpvalueState::Open(slot) if slot == stack_slot => return upvalue.clone(),
                UpvalueState::Open(slot) if slot < stack_slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let upvalue = Rc::new(Upvalue::new_open(stack_slot));
        self.open_upvalues.insert(insert_at, upvalue.clone());
        upvalue
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(first) = self.open_upvalues.first() {
            let slot = match *first.0.borrow() {
                UpvalueState::Open(slot) => slot,
                UpvalueState::Closed(_) => break,
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot].clone();
            *first.0.borrow_mut() = UpvalueState::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // --- the interpreter loop --------------------------------------------

    fn run(&mut self, reporter: &mut dyn Reporter) -> Result<(), ()> {
        loop {
            #[cfg(feature = "debug-execution")]
            {
                let frame = self.frame();
                let (row, _) = frame.chunk().disassemble_instruction(frame.ip);
                eprint!("          stack: {:?}\n{}", self.stack, row);
            }

            let byte = self.read_u8();
            let op = OpCode::from_u8(byte);

            macro_rules! runtime_bail {
                ($msg:expr) => {{
                    self.runtime_error(reporter, $msg);
                    return Err(());
                }};
            }

            macro_rules! binary_numeric {
                ($op:tt, $wrap:expr) => {{
                    let b = self.pop();
                    let a = self.pop();
                    match (a.as_number(), b.as_number()) {
                        (Some(a), Some(b)) => self.push($wrap(a $op b)),
                        _ => runtime_bail!("Operands must be numbers".to_string()),
                    }
                }};
            }

            match op {
                OpCode::Const => {
                    let value = self.read_constant(false);
                    self.push(value);
                }
                OpCode::ConstLong => {
                    let value = self.read_constant(true);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.pop();
                    match value.as_number() {
                        Some(n) => self.push(Value::Number(-n)),
                        None => runtime_bail!("Operand must be a number".to_string()),
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => binary_numeric!(>, Value::Bool),
                OpCode::Less => binary_numeric!(<, Value::Bool),
                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    match (&a, &b) {
                        (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
                        (Value::Object(Object::String(x)), Value::Object(Object::String(y))) => {
                            let joined = format!("{}{}", x.chars, y.chars);
                            let interned = self.interner.intern(&joined);
                            self.push(Value::from(interned));
                        }
                        _ => runtime_bail!("Operands must be two numbers or two strings".to_string()),
                    }
                }
                OpCode::Sub => binary_numeric!(-, Value::Number),
                OpCode::Mul => binary_numeric!(*, Value::Number),
                OpCode::Div => binary_numeric!(/, Value::Number),
                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let long = op == OpCode::DefineGlobalLong;
                    let name = self.read_constant(long);
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let long = op == OpCode::GetGlobalLong;
                    let name = self.read_constant(long);
                    match self.globals.get(&name) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value);
                        }
                        None => {
                            let name_text = name.to_string();
                            runtime_bail!(format!("Undefined variable '{}'", name_text))
                        }
                    }
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let long = op == OpCode::SetGlobalLong;
                    let name = self.read_constant(long);
                    let value = self.peek(0).clone();
                    if self.globals.set(name.clone(), value) {
                        self.globals.delete(&name);
                        let name_text = name.to_string();
                        runtime_bail!(format!("Undefined variable '{}'", name_text))
                    }
                }
                OpCode::GetLocal | OpCode::GetLocalLong => {
                    let long = op == OpCode::GetLocalLong;
                    let slot = self.read_index(long);
                    let base = self.frame().base;
                    let value = self.stack[base + slot].clone();
                    self.push(value);
                }
                OpCode::SetLocal | OpCode::SetLocalLong => {
                    let long = op == OpCode::SetLocalLong;
                    let slot = self.read_index(long);
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0).clone();
                }
                OpCode::GetUpvalue | OpCode::GetUpvalueLong => {
                    let long = op == OpCode::GetUpvalueLong;
                    let slot = self.read_index(long);
                    let upvalue = self.frame().closure.upvalues[slot].clone();
                    let value = match &*upvalue.0.borrow() {
                        UpvalueState::Open(stack_slot) => self.stack[*stack_slot].clone(),
                        UpvalueState::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue | OpCode::SetUpvalueLong => {
                    let long = op == OpCode::SetUpvalueLong;
                    let slot = self.read_index(long);
                    let value = self.peek(0).clone();
                    let upvalue = self.frame().closure.upvalues[slot].clone();
                    let mut state = upvalue.0.borrow_mut();
                    match &mut *state {
                        UpvalueState::Open(stack_slot) => self.stack[*stack_slot] = value,
                        UpvalueState::Closed(slot_value) => *slot_value = value,
                    }
                }
                OpCode::Jump => {
                    let displacement = self.read_i16();
                    self.frame_mut().ip = (self.frame().ip as isize + displacement as isize) as usize;
                }
                OpCode::JumpIfTrue => {
                    let displacement = self.read_i16();
                    if !self.peek(0).is_falsey() {
                        self.frame_mut().ip = (self.frame().ip as isize + displacement as isize) as usize;
                    }
                }
                OpCode::JumpIfFalse => {
                    let displacement = self.read_i16();
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip = (self.frame().ip as isize + displacement as isize) as usize;
                    }
                }
                OpCode::Call => {
                    let argc = self.read_u8() as usize;
                    let callee = self.peek(argc).clone();
                    if let Err(message) = self.call_value(callee, argc) {
                        runtime_bail!(message)
                    }
                }
                OpCode::Closure => {
                    let fn_index = self.read_u8() as usize;
                    let function = match self.frame().chunk().constant(fn_index).clone() {
                        Value::Object(Object::Function(f)) => f,
                        _ => unreachable!("CLOSURE operand must index a function constant"),
                    };
                    let mut upvalues = Vec::with_capacity(function.upvalue_count);
                    for _ in 0..function.upvalue_count {
                        let is_local = self.read_u8() != 0;
                        let index = self.read_u8() as usize;
                        if is_local {
                            let base = self.frame().base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(self.frame().closure.upvalues[index].clone());
                        }
                    }
                    let closure = Rc::new(Closure { function, upvalues });
                    self.push(Value::from(closure));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.push(result);
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{}", value);
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CapturingReporter;

    fn run(source: &str) -> (RunResult, CapturingReporter) {
        let mut vm = Vm::new();
        let mut reporter = CapturingReporter::default();
        let result = vm.interpret(source, &mut reporter);
        (result, reporter)
    }

    #[test]
    fn arithmetic_and_print_run_without_error() {
        let (result, reporter) = run("print 1 + 2 * 3;");
        assert!(matches!(result, RunResult::Ok));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn string_concatenation_interns_result() {
        let (result, reporter) = run("print \"foo\" + \"bar\";");
        assert!(matches!(result, RunResult::Ok));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn globals_persist_across_statements() {
        let (result, reporter) = run("var x = 1; x = x + 1; print x;");
        assert!(matches!(result, RunResult::Ok));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn undefined_global_read_is_a_runtime_error() {
        let (result, reporter) = run("print nope;");
        assert!(matches!(result, RunResult::RuntimeError));
        assert_eq!(reporter.errors.len(), 1);
        assert!(reporter.errors[0].message.contains("Undefined variable"));
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let (result, reporter) = run("var x = 1; x();");
        assert!(matches!(result, RunResult::RuntimeError));
        assert!(reporter.errors[0].message.contains("Can only call functions"));
    }

    #[test]
    fn wrong_arity_is_a_runtime_error() {
        let (result, reporter) = run("fun f(a, b) { return a + b; } f(1);");
        assert!(matches!(result, RunResult::RuntimeError));
        assert!(reporter.errors[0].message.contains("Expected 2 arguments"));
    }

    #[test]
    fn closures_capture_enclosing_locals_by_reference() {
        let (result, reporter) = run(
            "fun counter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; }
             var c = counter();
             print c(); print c(); print c();",
        );
        assert!(matches!(result, RunResult::Ok));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn closing_a_higher_slot_upvalue_does_not_leave_a_lower_one_open() {
        let (result, reporter) = run(
            "fun outer() {
               var a = 1;
               fun getA() { return a; }
               {
                 var b = 2;
                 fun getB() { return b; }
               }
               return getA;
             }
             print outer()();",
        );
        assert!(matches!(result, RunResult::Ok));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn recursive_function_can_call_itself() {
        let (result, reporter) = run(
            "fun fact(n) { if (n <= 1) return 1; return n * fact(n - 1); }
             print fact(5);",
        );
        assert!(matches!(result, RunResult::Ok));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn for_loop_and_break_continue_run_cleanly() {
        let (result, reporter) = run(
            "var total = 0;
             for (var i = 0; i < 10; i = i + 1) {
               if (i == 5) continue;
               if (i == 8) break;
               total = total + i;
             }
             print total;",
        );
        assert!(matches!(result, RunResult::Ok));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn switch_statement_executes_matching_case_only() {
        let (result, reporter) = run(
            "var x = 2;
             switch (x) {
               case 1: print \"one\";
               case 2: print \"two\";
               default: print \"other\";
             }",
        );
        assert!(matches!(result, RunResult::Ok));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn compile_error_short_circuits_execution() {
        let (result, _reporter) = run("var x = ;");
        assert!(matches!(result, RunResult::CompileError));
    }

    #[test]
    fn clock_native_returns_a_number() {
        let (result, reporter) = run("print clock() >= 0;");
        assert!(matches!(result, RunResult::Ok));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn adding_number_and_string_is_a_runtime_error() {
        let (result, reporter) = run("print 1 + \"x\";");
        assert!(matches!(result, RunResult::RuntimeError));
        assert!(reporter.errors[0].message.contains("Operands must be"));
    }
}
