use super::value::{Object, Value};
use std::fmt;

/// One opcode byte, optionally followed by inline operands. No
/// alignment is assumed anywhere in the stream; multi-byte operands
/// are read and written little-endian.
///
/// Most indexed instructions have an 8-bit form and a 32-bit `_LONG`
/// form. The compiler emits the short form whenever the index fits in
/// a byte and only pays the wider encoding past that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Const,
    ConstLong,
    Nil,
    True,
    False,
    Pop,
    Not,
    Negate,
    Equal,
    Greater,
    Less,
    Add,
    Sub,
    Mul,
    Div,
    DefineGlobal,
    DefineGlobalLong,
    GetGlobal,
    GetGlobalLong,
    SetGlobal,
    SetGlobalLong,
    GetLocal,
    GetLocalLong,
    SetLocal,
    SetLocalLong,
    GetUpvalue,
    GetUpvalueLong,
    SetUpvalue,
    SetUpvalueLong,
    Jump,
    JumpIfTrue,
    JumpIfFalse,
    Call,
    Return,
    Closure,
    CloseUpvalue,
    Print,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Self {
        // Safety-free decode: the compiler is the only producer of code
        // bytes and always writes a valid discriminant.
        const TABLE: &[OpCode] = &[
            OpCode::Const,
            OpCode::ConstLong,
            OpCode::Nil,
            OpCode::True,
            OpCode::False,
            OpCode::Pop,
            OpCode::Not,
            OpCode::Negate,
            OpCode::Equal,
            OpCode::Greater,
            OpCode::Less,
            OpCode::Add,
            OpCode::Sub,
            OpCode::Mul,
            OpCode::Div,
            OpCode::DefineGlobal,
            OpCode::DefineGlobalLong,
            OpCode::GetGlobal,
            OpCode::GetGlobalLong,
            OpCode::SetGlobal,
            OpCode::SetGlobalLong,
            OpCode::GetLocal,
            OpCode::GetLocalLong,
            OpCode::SetLocal,
            OpCode::SetLocalLong,
            OpCode::GetUpvalue,
            OpCode::GetUpvalueLong,
            OpCode::SetUpvalue,
            OpCode::SetUpvalueLong,
            OpCode::Jump,
            OpCode::JumpIfTrue,
            OpCode::JumpIfFalse,
            OpCode::Call,
            OpCode::Return,
            OpCode::Closure,
            OpCode::CloseUpvalue,
            OpCode::Print,
        ];
        TABLE[byte as usize]
    }

    fn name(self) -> &'static str {
        match self {
            OpCode::Const => "CONST",
            OpCode::ConstLong => "CONST_LONG",
            OpCode::Nil => "NIL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Pop => "POP",
            OpCode::Not => "NOT",
            OpCode::Negate => "NEGATE",
            OpCode::Equal => "EQUAL",
            OpCode::Greater => "GREATER",
            OpCode::Less => "LESS",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::DefineGlobal => "DEFINE_GLOBAL",
            OpCode::DefineGlobalLong => "DEFINE_GLOBAL_LONG",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::GetGlobalLong => "GET_GLOBAL_LONG",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::SetGlobalLong => "SET_GLOBAL_LONG",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::GetLocalLong => "GET_LOCAL_LONG",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::SetLocalLong => "SET_LOCAL_LONG",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::GetUpvalueLong => "GET_UPVALUE_LONG",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::SetUpvalueLong => "SET_UPVALUE_LONG",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfTrue => "JUMP_IF_TRUE",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::Closure => "CLOSURE",
            OpCode::CloseUpvalue => "CLOSE_UPVALUE",
            OpCode::Print => "PRINT",
        }
    }
}

/// Byte-addressable instruction buffer plus its constant pool and a
/// run-length-encoded line table. `line_infos[i] = (line, run_length)`;
/// the run lengths sum to `code.len()` and lines are non-decreasing.
#[derive(Clone)]
pub struct Chunk {
    code: Vec<u8>,
    constants: Vec<Value>,
    line_infos: Vec<(u32, u32)>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk { code: Vec::new(), constants: Vec::new(), line_infos: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    fn record_line(&mut self, line: u32, bytes: u32) {
        match self.line_infos.last_mut() {
            Some((last_line, run)) if *last_line == line => *run += bytes,
            _ => self.line_infos.push((line, bytes)),
        }
    }

    pub fn write_u8(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.record_line(line, 1);
    }

    pub fn write_u32(&mut self, word: u32, line: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
        self.record_line(line, 4);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write_u8(op as u8, line);
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let bytes = [
            self.code[offset],
            self.code[offset + 1],
            self.code[offset + 2],
            self.code[offset + 3],
        ];
        u32::from_le_bytes(bytes)
    }

    pub fn patch_u8(&mut self, offset: usize, byte: u8) {
        self.code[offset] = byte;
    }

    pub fn patch_i16(&mut self, offset: usize, value: i16) {
        let bytes = value.to_le_bytes();
        self.code[offset] = bytes[0];
        self.code[offset + 1] = bytes[1];
    }

    pub fn read_i16(&self, offset: usize) -> i16 {
        i16::from_le_bytes([self.code[offset], self.code[offset + 1]])
    }

    /// Linear scan; only ever invoked on error reporting and disassembly,
    /// where O(chunk length) is fine.
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let mut seen = 0usize;
        for (line, run) in &self.line_infos {
            seen += *run as usize;
            if offset < seen {
                return *line;
            }
        }
        self.line_infos.last().map(|(line, _)| *line).unwrap_or(0)
    }

    /// Structural-equality dedup: constants are compared with `==`,
    /// which for already-interned strings and numbers behaves like the
    /// reference's `valuesEqual`-based lookup.
    pub fn add_constant(&mut self, value: Value) -> usize {
        if let Some(index) = self.constants.iter().position(|existing| *existing == value) {
            return index;
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn constant(&self, index: usize) -> &Value {
        &self.constants[index]
    }

    pub fn constants_len(&self) -> usize {
        self.constants.len()
    }

    /// Emits a `Jump`/`JumpIfTrue`/`JumpIfFalse` with a placeholder
    /// displacement and returns the offset of the opcode byte, so the
    /// caller can `patch_jump` once the target is known.
    pub fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        let offset = self.len();
        self.write_op(op, line);
        self.write_u8(0, line);
        self.write_u8(0, line);
        offset
    }

    /// Patches the displacement of a jump emitted at `jump_offset` so it
    /// lands at the current end of the chunk. Displacement is measured
    /// from `jump_offset + 3` (the byte after the 3-byte instruction).
    pub fn patch_jump(&mut self, jump_offset: usize) -> Result<(), ()> {
        let target = self.len() as isize;
        let from = (jump_offset + 3) as isize;
        let displacement = target - from;
        if displacement < i16::MIN as isize || displacement > i16::MAX as isize {
            return Err(());
        }
        self.patch_i16(jump_offset + 1, displacement as i16);
        Ok(())
    }

    /// Emits a backward jump (used by `while`/`for`) straight to
    /// `loop_start` without a separate patch step.
    pub fn emit_loop(&mut self, op: OpCode, loop_start: usize, line: u32) -> Result<(), ()> {
        let offset = self.len();
        let from = (offset + 3) as isize;
        let displacement = loop_start as isize - from;
        if displacement < i16::MIN as isize || displacement > i16::MAX as isize {
            return Err(());
        }
        self.write_op(op, line);
        self.write_u8((displacement as i16).to_le_bytes()[0], line);
        self.write_u8((displacement as i16).to_le_bytes()[1], line);
        Ok(())
    }

    pub fn disassemble(&self, name: &str) -> String {
        let mut buffer = format!("== {} ==\n", name);
        let mut offset = 0;
        while offset < self.len() {
            let (row, next) = self.disassemble_instruction(offset);
            buffer += &row;
            offset = next;
        }
        buffer
    }

    /// Returns the formatted row for the instruction at `offset` and the
    /// offset of the following instruction.
    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let line = self.line_for_offset(offset);
        let line_col = if offset > 0 && self.line_for_offset(offset - 1) == line {
            "   |".to_string()
        } else {
            format!("{:4}", line)
        };
        let op = OpCode::from_u8(self.read_u8(offset));

        macro_rules! simple {
            () => {
                (format!("{:04} {} {}\n", offset, line_col, op.name()), offset + 1)
            };
        }

        macro_rules! constant_row {
            ($width:expr) => {{
                let (index, next) = if $width == 1 {
                    (self.read_u8(offset + 1) as usize, offset + 2)
                } else {
                    (self.read_u32(offset + 1) as usize, offset + 5)
                };
                let value = &self.constants[index];
                let mut row = format!(
                    "{:04} {} {} {:4} ({})\n",
                    offset,
                    line_col,
                    op.name(),
                    index,
                    value
                );
                if let Value::Object(Object::Function(f)) = value {
                    row += &f.chunk.disassemble(&f.name.as_ref().map(|n| n.chars.clone()).unwrap_or_else(|| "script".to_string()));
                }
                (row, next)
            }};
        }

        macro_rules! byte_operand {
            () => {{
                let slot = self.read_u8(offset + 1);
                (format!("{:04} {} {} {:4}\n", offset, line_col, op.name(), slot), offset + 2)
            }};
        }

        macro_rules! long_operand {
            () => {{
                let slot = self.read_u32(offset + 1);
                (format!("{:04} {} {} {:4}\n", offset, line_col, op.name(), slot), offset + 5)
            }};
        }

        macro_rules! jump_row {
            ($sign:expr) => {{
                let displacement = self.read_i16(offset + 1) as isize;
                let target = offset as isize + 3 + displacement;
                (
                    format!("{:04} {} {} {:+} -> {}\n", offset, line_col, op.name(), displacement * $sign, target),
                    offset + 3,
                )
            }};
        }

        match op {
            OpCode::Nil
            | OpCode::True
            | OpCode::False
            | OpCode::Pop
            | OpCode::Not
            | OpCode::Negate
            | OpCode::Equal
            | OpCode::Greater
            | OpCode::Less
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Return
            | OpCode::CloseUpvalue
            | OpCode::Print => simple!(),

            OpCode::Const
            | OpCode::DefineGlobal
            | OpCode::GetGlobal
            | OpCode::SetGlobal => constant_row!(1),
            OpCode::ConstLong
            | OpCode::DefineGlobalLong
            | OpCode::GetGlobalLong
            | OpCode::SetGlobalLong => constant_row!(4),

            OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue | OpCode::Call => {
                byte_operand!()
            }
            OpCode::GetLocalLong | OpCode::SetLocalLong | OpCode::GetUpvalueLong | OpCode::SetUpvalueLong => {
                long_operand!()
            }

            OpCode::Jump | OpCode::JumpIfTrue | OpCode::JumpIfFalse => jump_row!(1),

            OpCode::Closure => {
                let fn_index = self.read_u8(offset + 1) as usize;
                let value = &self.constants[fn_index];
                let mut row = format!("{:04} {} {} {:4} ({})\n", offset, line_col, op.name(), fn_index, value);
                let upvalue_count = match value {
                    Value::Object(Object::Function(f)) => f.upvalue_count,
                    _ => 0,
                };
                let mut cursor = offset + 2;
                for _ in 0..upvalue_count {
                    let is_local = self.read_u8(cursor) != 0;
                    let index = self.read_u8(cursor + 1);
                    row += &format!(
                        "{:04}      |                     {} {}\n",
                        cursor,
                        if is_local { "local" } else { "upvalue" },
                        index
                    );
                    cursor += 2;
                }
                if let Value::Object(Object::Function(f)) = value {
                    row += &f.chunk.disassemble(&f.name.as_ref().map(|n| n.chars.clone()).unwrap_or_else(|| "script".to_string()));
                }
                (row, cursor)
            }
        }
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.disassemble("chunk"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_run_lengths_sum_to_code_length() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 2);
        let total: u32 = chunk.line_infos.iter().map(|(_, run)| run).sum();
        assert_eq!(total as usize, chunk.len());
        assert_eq!(chunk.line_infos, vec![(1, 2), (2, 1)]);
    }

    #[test]
    fn lines_are_non_decreasing() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Nil, 3);
        chunk.write_op(OpCode::Nil, 3);
        let lines: Vec<u32> = chunk.line_infos.iter().map(|(l, _)| *l).collect();
        let mut sorted = lines.clone();
        sorted.sort();
        assert_eq!(lines, sorted);
    }

    #[test]
    fn line_for_offset_matches_run_boundaries() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 10);
        chunk.write_u32(42, 10);
        chunk.write_op(OpCode::Pop, 11);
        assert_eq!(chunk.line_for_offset(0), 10);
        assert_eq!(chunk.line_for_offset(4), 10);
        assert_eq!(chunk.line_for_offset(5), 11);
    }

    #[test]
    fn add_constant_is_idempotent_for_equal_values() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(1.0));
        let b = chunk.add_constant(Value::Number(1.0));
        let c = chunk.add_constant(Value::Number(2.0));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn patch_jump_computes_displacement_from_instruction_end() {
        let mut chunk = Chunk::new();
        let jump = chunk.emit_jump(OpCode::Jump, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.patch_jump(jump).unwrap();
        assert_eq!(chunk.read_i16(jump + 1), 1);
    }

    #[test]
    fn patch_jump_rejects_out_of_range_displacement() {
        let mut chunk = Chunk::new();
        let jump = chunk.emit_jump(OpCode::Jump, 1);
        for _ in 0..70000 {
            chunk.write_u8(0, 1);
        }
        assert!(chunk.patch_jump(jump).is_err());
    }
}
