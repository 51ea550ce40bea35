// File: src/bytecode.rs
//
// Bytecode instruction definitions and the on-disk container format for
// the ST virtual machine. Defines the OpCode enum for all instructions,
// the constant pool, variable/function descriptor tables, the binary
// reader/writer, the load-time validator and the disassembler.

use crate::errors::VmError;
use crate::value::Value;
use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Magic bytes at the start of every bytecode file
pub const BYTECODE_MAGIC: [u8; 4] = *b"STBC";

/// Format version, major in the high 16 bits, minor in the low 16
pub const BYTECODE_VERSION: u32 = 0x0001_0000;

/// Longest allowed descriptor name; descriptors store 64 NUL-padded bytes
pub const MAX_NAME_LEN: usize = 63;

/// Bytecode instruction opcodes for the ST virtual machine.
/// Stack-based machine with separate operand and call stacks; the numeric
/// values are the on-disk encoding and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum OpCode {
    // === Control ===
    Nop = 0,
    Halt,

    // === Constant loads ===
    /// Operand: immediate i32 value
    LoadConstInt,
    /// Operand: immediate f64 value
    LoadConstReal,
    /// Operand: immediate 0/1 value
    LoadConstBool,
    /// Operand: constant pool index of a string entry
    LoadConstString,

    // === Variable loads ===
    /// Operand: slot offset within the current frame's locals
    LoadLocal,
    /// Operand: global slot index
    LoadGlobal,
    /// Operand: slot offset within the current frame's parameters
    LoadParam,

    // === Variable stores ===
    StoreLocal,
    StoreGlobal,
    StoreParam,

    // === Stack manipulation ===
    /// Reserve a stack slot (pushes Int 0)
    Push,
    Pop,
    Dup,
    Swap,

    // === Integer arithmetic (wrapping two's-complement) ===
    AddInt,
    SubInt,
    MulInt,
    /// Zero divisor is a fatal DivisionByZero
    DivInt,
    ModInt,
    NegInt,

    // === Real arithmetic (IEEE-754, no traps) ===
    AddReal,
    SubReal,
    MulReal,
    DivReal,
    NegReal,

    // === Boolean logic (strict, no short-circuit) ===
    AndBool,
    OrBool,
    XorBool,
    NotBool,

    // === Integer comparison ===
    EqInt,
    NeInt,
    LtInt,
    LeInt,
    GtInt,
    GeInt,

    // === Real comparison ===
    EqReal,
    NeReal,
    LtReal,
    LeReal,
    GtReal,
    GeReal,

    // === String comparison (lexicographic over bytes) ===
    EqString,
    NeString,
    LtString,
    LeString,
    GtString,
    GeString,

    // === Type conversion ===
    IntToReal,
    /// Truncates toward zero; out-of-range reals are fatal
    RealToInt,
    IntToString,
    RealToString,
    BoolToString,
    /// Parse failure is fatal
    StringToInt,
    StringToReal,

    // === Control flow ===
    Jmp,
    JmpTrue,
    JmpFalse,
    JmpEq,
    JmpNe,

    // === Calls ===
    /// Operand: entry address of a function descriptor
    Call,
    /// Operand: builtin table index
    CallBuiltin,
    /// Operand: library table index
    CallLibrary,
    Ret,
    RetValue,

    // === Aggregate access ===
    /// Pops index then base, pushes globals[base + index]
    ArrayLoad,
    /// Pops value, index, base; stores into globals[base + index]
    ArrayStore,
    /// Pops a variable-table index, pushes that descriptor's size
    ArrayLen,
    /// Operand: statically resolved absolute global slot
    StructLoad,
    StructStore,

    // === Debug ===
    /// Pops and prints the top of stack
    DebugPrint,
    /// Operand: user breakpoint tag
    Breakpoint,
    /// Operand: source line number
    LineInfo,

    // === Sync (primary/secondary mode) ===
    /// Operand: global index to mark dirty
    SyncVar,
    SyncCheckpoint,
}

/// One past the last valid opcode; files with opcodes at or above this
/// sentinel fail validation.
pub const OP_COUNT: u16 = OpCode::SyncCheckpoint as u16 + 1;

/// Operand kind declared by each opcode; the on-disk encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum OperandKind {
    None = 0,
    Int = 1,
    Real = 2,
    StrIndex = 3,
    Address = 4,
}

/// A decoded instruction operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    None,
    Int(i32),
    Real(f64),
    StrIndex(u32),
    Address(u32),
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::None => OperandKind::None,
            Operand::Int(_) => OperandKind::Int,
            Operand::Real(_) => OperandKind::Real,
            Operand::StrIndex(_) => OperandKind::StrIndex,
            Operand::Address(_) => OperandKind::Address,
        }
    }
}

/// One record of the interpreted program: opcode, at most one typed
/// operand and the source position it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Operand,
    pub source_line: u32,
    pub source_column: u32,
}

impl Instruction {
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Self { opcode, operand, source_line: 0, source_column: 0 }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.source_line = line;
        self.source_column = column;
        self
    }
}

/// Static per-opcode information: canonical mnemonic and declared operand kind
pub struct InstrInfo {
    pub mnemonic: &'static str,
    pub operand_kind: OperandKind,
}

static INSTR_INFO: [InstrInfo; OP_COUNT as usize] = [
    InstrInfo { mnemonic: "NOP", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "HALT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "LOAD_CONST_INT", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "LOAD_CONST_REAL", operand_kind: OperandKind::Real },
    InstrInfo { mnemonic: "LOAD_CONST_BOOL", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "LOAD_CONST_STRING", operand_kind: OperandKind::StrIndex },
    InstrInfo { mnemonic: "LOAD_LOCAL", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "LOAD_GLOBAL", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "LOAD_PARAM", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "STORE_LOCAL", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "STORE_GLOBAL", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "STORE_PARAM", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "PUSH", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "POP", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "DUP", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "SWAP", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "ADD_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "SUB_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "MUL_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "DIV_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "MOD_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "NEG_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "ADD_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "SUB_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "MUL_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "DIV_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "NEG_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "AND_BOOL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "OR_BOOL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "XOR_BOOL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "NOT_BOOL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "EQ_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "NE_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "LT_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "LE_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "GT_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "GE_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "EQ_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "NE_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "LT_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "LE_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "GT_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "GE_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "EQ_STRING", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "NE_STRING", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "LT_STRING", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "LE_STRING", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "GT_STRING", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "GE_STRING", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "INT_TO_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "REAL_TO_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "INT_TO_STRING", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "REAL_TO_STRING", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "BOOL_TO_STRING", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "STRING_TO_INT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "STRING_TO_REAL", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "JMP", operand_kind: OperandKind::Address },
    InstrInfo { mnemonic: "JMP_TRUE", operand_kind: OperandKind::Address },
    InstrInfo { mnemonic: "JMP_FALSE", operand_kind: OperandKind::Address },
    InstrInfo { mnemonic: "JMP_EQ", operand_kind: OperandKind::Address },
    InstrInfo { mnemonic: "JMP_NE", operand_kind: OperandKind::Address },
    InstrInfo { mnemonic: "CALL", operand_kind: OperandKind::Address },
    InstrInfo { mnemonic: "CALL_BUILTIN", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "CALL_LIBRARY", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "RET", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "RET_VALUE", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "ARRAY_LOAD", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "ARRAY_STORE", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "ARRAY_LEN", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "STRUCT_LOAD", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "STRUCT_STORE", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "DEBUG_PRINT", operand_kind: OperandKind::None },
    InstrInfo { mnemonic: "BREAKPOINT", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "LINE_INFO", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "SYNC_VAR", operand_kind: OperandKind::Int },
    InstrInfo { mnemonic: "SYNC_CHECKPOINT", operand_kind: OperandKind::None },
];

impl OpCode {
    pub fn info(self) -> &'static InstrInfo {
        &INSTR_INFO[self as usize]
    }

    pub fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    /// The single operand kind this opcode accepts
    pub fn operand_kind(self) -> OperandKind {
        self.info().operand_kind
    }
}

/// Constant pool entry discriminant; the on-disk encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConstKind {
    Int = 0,
    Real = 1,
    Bool = 2,
    String = 3,
}

/// A constant pool entry. The pool is deduplicated at build time:
/// identical literals share one index.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i32),
    Real(f64),
    Bool(bool),
    String(String),
}

impl Constant {
    pub fn kind(&self) -> ConstKind {
        match self {
            Constant::Int(_) => ConstKind::Int,
            Constant::Real(_) => ConstKind::Real,
            Constant::Bool(_) => ConstKind::Bool,
            Constant::String(_) => ConstKind::String,
        }
    }

    /// Owned runtime value for this constant
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Int(i) => Value::Int(*i),
            Constant::Real(r) => Value::Real(*r),
            Constant::Bool(b) => Value::Bool(*b),
            Constant::String(s) => Value::String(s.clone()),
        }
    }
}

/// Describes one program variable: where it lives and how big it is
#[derive(Debug, Clone, PartialEq)]
pub struct VarDescriptor {
    pub name: String,
    pub type_id: u32,
    pub offset: u32,
    pub size: u32,
    pub is_global: bool,
}

/// Describes one user function: entry address and frame layout
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDescriptor {
    pub name: String,
    pub address: u32,
    pub param_count: u32,
    pub local_size: u32,
    pub return_type: u32,
}

bitflags! {
    /// Header flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BytecodeFlags: u32 {
        const SYNC_ENABLED = 0b01;
        const DEBUG_INFO = 0b10;
    }
}

/// In-memory representation of a bytecode file: header fields plus the
/// instruction array, constant pool and descriptor tables
#[derive(Debug, Clone, PartialEq)]
pub struct BytecodeFile {
    pub version: u32,
    pub flags: BytecodeFlags,
    pub entry_point: u32,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub variables: Vec<VarDescriptor>,
    pub functions: Vec<FuncDescriptor>,
}

impl BytecodeFile {
    pub fn new() -> Self {
        Self {
            version: BYTECODE_VERSION,
            flags: BytecodeFlags::empty(),
            entry_point: 0,
            instructions: Vec::new(),
            constants: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn major_version(&self) -> u16 {
        (self.version >> 16) as u16
    }

    /// Validate the whole file in a single side-effect-free forward scan.
    /// Checks the version, entry point, opcode range, operand-kind
    /// agreement, address targets and string pool indices.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.major_version() != (BYTECODE_VERSION >> 16) as u16 {
            return Err(VmError::validation(format!(
                "incompatible bytecode version {:#x}",
                self.version
            )));
        }

        let instr_count = self.instructions.len() as u32;
        if instr_count == 0 {
            return Err(VmError::validation("empty instruction array"));
        }
        if self.entry_point >= instr_count {
            return Err(VmError::validation(format!(
                "entry point {} out of range ({} instructions)",
                self.entry_point, instr_count
            )));
        }

        for (index, instr) in self.instructions.iter().enumerate() {
            if instr.opcode as u16 >= OP_COUNT {
                return Err(VmError::validation(format!(
                    "invalid opcode {} at instruction {}",
                    instr.opcode as u16, index
                )));
            }

            let expected = instr.opcode.operand_kind();
            let actual = instr.operand.kind();
            if actual != expected {
                return Err(VmError::validation(format!(
                    "instruction {} ({}) carries {:?} operand, expected {:?}",
                    index,
                    instr.opcode.mnemonic(),
                    actual,
                    expected
                )));
            }

            match instr.operand {
                Operand::Address(addr) => {
                    if addr >= instr_count {
                        return Err(VmError::validation(format!(
                            "instruction {} ({}) jumps to {} past the end ({})",
                            index,
                            instr.opcode.mnemonic(),
                            addr,
                            instr_count
                        )));
                    }
                }
                Operand::StrIndex(str_index) => {
                    match self.constants.get(str_index as usize) {
                        Some(Constant::String(_)) => {}
                        Some(_) => {
                            return Err(VmError::validation(format!(
                                "instruction {} string index {} is not a string constant",
                                index, str_index
                            )));
                        }
                        None => {
                            return Err(VmError::validation(format!(
                                "instruction {} string index {} out of range ({} constants)",
                                index,
                                str_index,
                                self.constants.len()
                            )));
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    // ---- binary writer ----

    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut file = File::create(path)?;
        self.write_to(&mut file)
    }

    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&BYTECODE_MAGIC)?;
        out.write_all(&self.version.to_le_bytes())?;
        out.write_all(&self.flags.bits().to_le_bytes())?;
        out.write_all(&(self.instructions.len() as u32).to_le_bytes())?;
        out.write_all(&(self.constants.len() as u32).to_le_bytes())?;
        out.write_all(&(self.variables.len() as u32).to_le_bytes())?;
        out.write_all(&(self.functions.len() as u32).to_le_bytes())?;
        out.write_all(&self.entry_point.to_le_bytes())?;

        for instr in &self.instructions {
            write_instruction(out, instr)?;
        }

        for constant in &self.constants {
            out.write_all(&[constant.kind() as u8])?;
            match constant {
                Constant::Int(i) => out.write_all(&i.to_le_bytes())?,
                Constant::Real(r) => out.write_all(&r.to_le_bytes())?,
                Constant::Bool(b) => out.write_all(&[*b as u8])?,
                Constant::String(s) => {
                    out.write_all(&(s.len() as u32).to_le_bytes())?;
                    out.write_all(s.as_bytes())?;
                }
            }
        }

        for var in &self.variables {
            write_name(out, &var.name)?;
            out.write_all(&var.type_id.to_le_bytes())?;
            out.write_all(&var.offset.to_le_bytes())?;
            out.write_all(&var.size.to_le_bytes())?;
            out.write_all(&[var.is_global as u8])?;
        }

        for func in &self.functions {
            write_name(out, &func.name)?;
            out.write_all(&func.address.to_le_bytes())?;
            out.write_all(&func.param_count.to_le_bytes())?;
            out.write_all(&func.local_size.to_le_bytes())?;
            out.write_all(&func.return_type.to_le_bytes())?;
        }

        if self.flags.contains(BytecodeFlags::DEBUG_INFO) {
            let entries: Vec<(u32, u32, u32)> = self
                .instructions
                .iter()
                .enumerate()
                .filter(|(_, i)| i.source_line != 0)
                .map(|(idx, i)| (idx as u32, i.source_line, i.source_column))
                .collect();
            out.write_all(&(entries.len() as u32).to_le_bytes())?;
            for (index, line, column) in entries {
                out.write_all(&index.to_le_bytes())?;
                out.write_all(&line.to_le_bytes())?;
                out.write_all(&column.to_le_bytes())?;
            }
        }

        Ok(())
    }

    // ---- binary reader ----

    pub fn load(path: impl AsRef<Path>) -> Result<Self, VmError> {
        let mut file = File::open(&path).map_err(|e| {
            VmError::load(format!("cannot open {}: {}", path.as_ref().display(), e))
        })?;
        Self::read_from(&mut file)
    }

    pub fn read_from(input: &mut impl Read) -> Result<Self, VmError> {
        let mut magic = [0u8; 4];
        read_exact(input, &mut magic)?;
        if magic != BYTECODE_MAGIC {
            return Err(VmError::load("bad magic, not a bytecode file"));
        }

        let version = read_u32(input)?;
        if (version >> 16) != (BYTECODE_VERSION >> 16) {
            return Err(VmError::load(format!("incompatible bytecode version {:#x}", version)));
        }

        let flags = BytecodeFlags::from_bits(read_u32(input)?)
            .ok_or_else(|| VmError::load("unknown header flag bits"))?;
        let instr_count = read_u32(input)?;
        let const_count = read_u32(input)?;
        let var_count = read_u32(input)?;
        let func_count = read_u32(input)?;
        let entry_point = read_u32(input)?;

        let mut instructions = Vec::with_capacity(instr_count as usize);
        for _ in 0..instr_count {
            instructions.push(read_instruction(input)?);
        }

        let mut constants = Vec::with_capacity(const_count as usize);
        for _ in 0..const_count {
            let kind = ConstKind::try_from(read_u8(input)?)
                .map_err(|_| VmError::load("invalid constant pool entry kind"))?;
            let constant = match kind {
                ConstKind::Int => Constant::Int(read_i32(input)?),
                ConstKind::Real => Constant::Real(read_f64(input)?),
                ConstKind::Bool => Constant::Bool(read_u8(input)? != 0),
                ConstKind::String => {
                    let length = read_u32(input)? as usize;
                    let mut bytes = vec![0u8; length];
                    read_exact(input, &mut bytes)?;
                    let text = String::from_utf8(bytes)
                        .map_err(|_| VmError::load("string constant is not valid UTF-8"))?;
                    Constant::String(text)
                }
            };
            constants.push(constant);
        }

        let mut variables = Vec::with_capacity(var_count as usize);
        for _ in 0..var_count {
            let name = read_name(input)?;
            variables.push(VarDescriptor {
                name,
                type_id: read_u32(input)?,
                offset: read_u32(input)?,
                size: read_u32(input)?,
                is_global: read_u8(input)? != 0,
            });
        }

        let mut functions = Vec::with_capacity(func_count as usize);
        for _ in 0..func_count {
            let name = read_name(input)?;
            functions.push(FuncDescriptor {
                name,
                address: read_u32(input)?,
                param_count: read_u32(input)?,
                local_size: read_u32(input)?,
                return_type: read_u32(input)?,
            });
        }

        if flags.contains(BytecodeFlags::DEBUG_INFO) {
            let count = read_u32(input)?;
            for _ in 0..count {
                let index = read_u32(input)? as usize;
                let line = read_u32(input)?;
                let column = read_u32(input)?;
                if let Some(instr) = instructions.get_mut(index) {
                    instr.source_line = line;
                    instr.source_column = column;
                }
            }
        }

        Ok(Self { version, flags, entry_point, instructions, constants, variables, functions })
    }

    // ---- disassembler ----

    /// Full textual dump: header summary, instructions, constant pool and
    /// descriptor tables
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "; stbc v{}.{} flags={:#x} entry={} ({} instructions, {} constants)",
            self.version >> 16,
            self.version & 0xffff,
            self.flags.bits(),
            self.entry_point,
            self.instructions.len(),
            self.constants.len()
        );

        for (index, instr) in self.instructions.iter().enumerate() {
            let _ = writeln!(out, "{:4}: {}", index, disassemble_instruction(instr));
        }

        if !self.constants.is_empty() {
            let _ = writeln!(out, "; constant pool");
            for (index, constant) in self.constants.iter().enumerate() {
                let rendered = match constant {
                    Constant::Int(i) => format!("int {}", i),
                    Constant::Real(r) => format!("real {}", r),
                    Constant::Bool(b) => format!("bool {}", b),
                    Constant::String(s) => format!("string {:?}", s),
                };
                let _ = writeln!(out, ";   [{}] {}", index, rendered);
            }
        }

        if !self.variables.is_empty() {
            let _ = writeln!(out, "; variables");
            for var in &self.variables {
                let _ = writeln!(
                    out,
                    ";   {} type={} offset={} size={} {}",
                    var.name,
                    var.type_id,
                    var.offset,
                    var.size,
                    if var.is_global { "global" } else { "local" }
                );
            }
        }

        if !self.functions.is_empty() {
            let _ = writeln!(out, "; functions");
            for func in &self.functions {
                let _ = writeln!(
                    out,
                    ";   {} @{} params={} locals={} ret={}",
                    func.name, func.address, func.param_count, func.local_size, func.return_type
                );
            }
        }

        out
    }
}

impl Default for BytecodeFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Render one instruction as `MNEMONIC operand`, with source position
/// appended when known
pub fn disassemble_instruction(instr: &Instruction) -> String {
    let mut text = match instr.operand {
        Operand::None => instr.opcode.mnemonic().to_string(),
        Operand::Int(i) => format!("{} {}", instr.opcode.mnemonic(), i),
        Operand::Real(r) => format!("{} {}", instr.opcode.mnemonic(), r),
        Operand::StrIndex(s) => format!("{} [str_{}]", instr.opcode.mnemonic(), s),
        Operand::Address(a) => format!("{} @{}", instr.opcode.mnemonic(), a),
    };
    if instr.source_line != 0 {
        let _ = write!(text, " ; line {}, col {}", instr.source_line, instr.source_column);
    }
    text
}

// ---- fixed-width I/O helpers (little-endian) ----

fn write_instruction(out: &mut impl Write, instr: &Instruction) -> io::Result<()> {
    out.write_all(&(instr.opcode as u16).to_le_bytes())?;
    out.write_all(&(instr.operand.kind() as u16).to_le_bytes())?;

    let mut operand_bytes = [0u8; 8];
    match instr.operand {
        Operand::None => {}
        Operand::Int(i) => operand_bytes[..4].copy_from_slice(&i.to_le_bytes()),
        Operand::Real(r) => operand_bytes.copy_from_slice(&r.to_le_bytes()),
        Operand::StrIndex(s) => operand_bytes[..4].copy_from_slice(&s.to_le_bytes()),
        Operand::Address(a) => operand_bytes[..4].copy_from_slice(&a.to_le_bytes()),
    }
    out.write_all(&operand_bytes)?;
    out.write_all(&instr.source_line.to_le_bytes())?;
    out.write_all(&instr.source_column.to_le_bytes())
}

fn read_instruction(input: &mut impl Read) -> Result<Instruction, VmError> {
    let raw_opcode = read_u16(input)?;
    let opcode = OpCode::try_from(raw_opcode)
        .map_err(|_| VmError::load(format!("invalid opcode {}", raw_opcode)))?;

    let raw_kind = read_u16(input)?;
    let kind = OperandKind::try_from(raw_kind)
        .map_err(|_| VmError::load(format!("invalid operand kind {}", raw_kind)))?;

    let mut operand_bytes = [0u8; 8];
    read_exact(input, &mut operand_bytes)?;
    let operand = match kind {
        OperandKind::None => Operand::None,
        OperandKind::Int => {
            Operand::Int(i32::from_le_bytes(operand_bytes[..4].try_into().unwrap()))
        }
        OperandKind::Real => Operand::Real(f64::from_le_bytes(operand_bytes)),
        OperandKind::StrIndex => {
            Operand::StrIndex(u32::from_le_bytes(operand_bytes[..4].try_into().unwrap()))
        }
        OperandKind::Address => {
            Operand::Address(u32::from_le_bytes(operand_bytes[..4].try_into().unwrap()))
        }
    };

    Ok(Instruction {
        opcode,
        operand,
        source_line: read_u32(input)?,
        source_column: read_u32(input)?,
    })
}

fn write_name(out: &mut impl Write, name: &str) -> io::Result<()> {
    let mut bytes = [0u8; MAX_NAME_LEN + 1];
    let len = name.len().min(MAX_NAME_LEN);
    bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
    out.write_all(&bytes)
}

fn read_name(input: &mut impl Read) -> Result<String, VmError> {
    let mut bytes = [0u8; MAX_NAME_LEN + 1];
    read_exact(input, &mut bytes)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| VmError::load("descriptor name is not valid UTF-8"))
}

fn read_exact(input: &mut impl Read, buffer: &mut [u8]) -> Result<(), VmError> {
    input.read_exact(buffer).map_err(|_| VmError::load("truncated bytecode file"))
}

fn read_u8(input: &mut impl Read) -> Result<u8, VmError> {
    let mut buffer = [0u8; 1];
    read_exact(input, &mut buffer)?;
    Ok(buffer[0])
}

fn read_u16(input: &mut impl Read) -> Result<u16, VmError> {
    let mut buffer = [0u8; 2];
    read_exact(input, &mut buffer)?;
    Ok(u16::from_le_bytes(buffer))
}

fn read_u32(input: &mut impl Read) -> Result<u32, VmError> {
    let mut buffer = [0u8; 4];
    read_exact(input, &mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

fn read_i32(input: &mut impl Read) -> Result<i32, VmError> {
    let mut buffer = [0u8; 4];
    read_exact(input, &mut buffer)?;
    Ok(i32::from_le_bytes(buffer))
}

fn read_f64(input: &mut impl Read) -> Result<f64, VmError> {
    let mut buffer = [0u8; 8];
    read_exact(input, &mut buffer)?;
    Ok(f64::from_le_bytes(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> BytecodeFile {
        let mut file = BytecodeFile::new();
        file.constants.push(Constant::String("hello".into()));
        file.instructions = vec![
            Instruction::new(OpCode::LoadConstInt, Operand::Int(3)).at(1, 6),
            Instruction::new(OpCode::LoadConstInt, Operand::Int(4)),
            Instruction::new(OpCode::AddInt, Operand::None),
            Instruction::new(OpCode::StoreGlobal, Operand::Int(0)),
            Instruction::new(OpCode::LoadConstString, Operand::StrIndex(0)),
            Instruction::new(OpCode::DebugPrint, Operand::None),
            Instruction::new(OpCode::Halt, Operand::None),
        ];
        file.variables.push(VarDescriptor {
            name: "x".into(),
            type_id: 1,
            offset: 0,
            size: 1,
            is_global: true,
        });
        file
    }

    #[test]
    fn every_opcode_has_info() {
        for raw in 0..OP_COUNT {
            let opcode = OpCode::try_from(raw).expect("opcode in range decodes");
            assert!(!opcode.mnemonic().is_empty());
        }
        assert!(OpCode::try_from(OP_COUNT).is_err());
    }

    #[test]
    fn operand_kinds_follow_the_table() {
        assert_eq!(OpCode::Jmp.operand_kind(), OperandKind::Address);
        assert_eq!(OpCode::Call.operand_kind(), OperandKind::Address);
        assert_eq!(OpCode::LoadConstString.operand_kind(), OperandKind::StrIndex);
        assert_eq!(OpCode::LoadConstReal.operand_kind(), OperandKind::Real);
        assert_eq!(OpCode::StoreGlobal.operand_kind(), OperandKind::Int);
        assert_eq!(OpCode::AddInt.operand_kind(), OperandKind::None);
    }

    #[test]
    fn validate_accepts_well_formed_file() {
        sample_file().validate().unwrap();
    }

    #[test]
    fn validate_rejects_entry_point_past_end() {
        let mut file = sample_file();
        file.entry_point = 99;
        assert!(file.validate().is_err());
    }

    #[test]
    fn validate_rejects_operand_kind_mismatch() {
        let mut file = sample_file();
        file.instructions[2] = Instruction::new(OpCode::AddInt, Operand::Int(1));
        assert!(file.validate().is_err());
    }

    #[test]
    fn validate_rejects_jump_past_end() {
        let mut file = sample_file();
        file.instructions[1] = Instruction::new(OpCode::Jmp, Operand::Address(1000));
        assert!(file.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_string_index() {
        let mut file = sample_file();
        file.instructions[4] = Instruction::new(OpCode::LoadConstString, Operand::StrIndex(7));
        assert!(file.validate().is_err());

        // Index in range but pointing at a non-string entry
        let mut file = sample_file();
        file.constants[0] = Constant::Int(5);
        assert!(file.validate().is_err());
    }

    #[test]
    fn file_round_trips_through_bytes() {
        let mut original = sample_file();
        original.flags |= BytecodeFlags::DEBUG_INFO;

        let mut bytes = Vec::new();
        original.write_to(&mut bytes).unwrap();

        let reread = BytecodeFile::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(reread, original);
    }

    #[test]
    fn reader_rejects_bad_magic() {
        let mut bytes = Vec::new();
        sample_file().write_to(&mut bytes).unwrap();
        bytes[0] = b'X';
        assert!(BytecodeFile::read_from(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn reader_rejects_major_version_mismatch() {
        let mut bytes = Vec::new();
        sample_file().write_to(&mut bytes).unwrap();
        bytes[4..8].copy_from_slice(&0x0002_0000u32.to_le_bytes());
        assert!(BytecodeFile::read_from(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn disassembly_uses_canonical_mnemonics() {
        let instr = Instruction::new(OpCode::Jmp, Operand::Address(12));
        assert_eq!(disassemble_instruction(&instr), "JMP @12");

        let instr = Instruction::new(OpCode::LoadConstInt, Operand::Int(-5)).at(3, 1);
        assert_eq!(disassemble_instruction(&instr), "LOAD_CONST_INT -5 ; line 3, col 1");

        let text = sample_file().disassemble();
        assert!(text.contains("ADD_INT"));
        assert!(text.contains("[str_0]"));
    }
}
