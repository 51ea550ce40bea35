// File: src/generator.rs
//
// Build-time bytecode construction: instruction emission with jump
// patching, label management, deduplicated constant pool and the
// variable/function descriptor tables. The code generator for the ST
// frontend drives this; tests use it to author programs directly.

use crate::bytecode::{
    BytecodeFile, BytecodeFlags, Constant, FuncDescriptor, Instruction, OpCode, Operand,
    VarDescriptor, BYTECODE_VERSION, MAX_NAME_LEN,
};
use crate::errors::VmError;
use ahash::AHashMap;

#[derive(Debug, Default)]
struct Label {
    address: Option<u32>,
    /// Instruction indices whose address operand still needs this label
    fixups: Vec<u32>,
}

/// Incremental builder for a bytecode file
#[derive(Debug)]
pub struct BytecodeBuilder {
    instructions: Vec<Instruction>,
    constants: Vec<Constant>,
    variables: Vec<VarDescriptor>,
    functions: Vec<FuncDescriptor>,
    labels: AHashMap<String, Label>,
    flags: BytecodeFlags,
    entry_point: u32,
    next_global_offset: u32,
    next_local_offset: u32,
    current_line: u32,
    current_column: u32,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            constants: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
            labels: AHashMap::new(),
            flags: BytecodeFlags::empty(),
            entry_point: 0,
            next_global_offset: 0,
            next_local_offset: 0,
            current_line: 0,
            current_column: 0,
        }
    }

    /// Source position applied to subsequently emitted instructions
    pub fn set_source(&mut self, line: u32, column: u32) {
        self.current_line = line;
        self.current_column = column;
    }

    pub fn set_flags(&mut self, flags: BytecodeFlags) {
        self.flags = flags;
    }

    pub fn set_entry_point(&mut self, address: u32) {
        self.entry_point = address;
    }

    /// Address the next emitted instruction will get
    pub fn next_address(&self) -> u32 {
        self.instructions.len() as u32
    }

    // ---- instruction emission ----

    fn push_instruction(&mut self, opcode: OpCode, operand: Operand) -> u32 {
        let index = self.instructions.len() as u32;
        self.instructions
            .push(Instruction::new(opcode, operand).at(self.current_line, self.current_column));
        index
    }

    /// Emit an instruction with no operand, returning its address
    pub fn emit(&mut self, opcode: OpCode) -> u32 {
        self.push_instruction(opcode, Operand::None)
    }

    pub fn emit_int(&mut self, opcode: OpCode, operand: i32) -> u32 {
        self.push_instruction(opcode, Operand::Int(operand))
    }

    pub fn emit_real(&mut self, opcode: OpCode, operand: f64) -> u32 {
        self.push_instruction(opcode, Operand::Real(operand))
    }

    pub fn emit_addr(&mut self, opcode: OpCode, address: u32) -> u32 {
        self.push_instruction(opcode, Operand::Address(address))
    }

    /// Emit a string-carrying instruction; the string goes through the
    /// deduplicated constant pool
    pub fn emit_str(&mut self, opcode: OpCode, text: &str) -> u32 {
        let str_index = self.add_const_string(text);
        self.push_instruction(opcode, Operand::StrIndex(str_index))
    }

    /// Retarget an already-emitted address instruction
    pub fn patch_jump(&mut self, instr_index: u32, target: u32) {
        let instr = &mut self.instructions[instr_index as usize];
        match instr.operand {
            Operand::Address(_) => instr.operand = Operand::Address(target),
            _ => panic!("attempted to patch a non-address instruction"),
        }
    }

    // ---- labels ----

    /// Emit an address instruction targeting a label that may not be
    /// marked yet; the address is patched when the label is marked
    pub fn emit_jump_to(&mut self, opcode: OpCode, label: &str) -> u32 {
        let entry = self.labels.entry(label.to_string()).or_default();
        if let Some(address) = entry.address {
            self.push_instruction(opcode, Operand::Address(address))
        } else {
            let index = self.instructions.len() as u32;
            entry.fixups.push(index);
            self.push_instruction(opcode, Operand::Address(0))
        }
    }

    /// Bind a label to the next instruction address and patch every
    /// pending reference to it
    pub fn mark_label(&mut self, label: &str) -> u32 {
        let address = self.instructions.len() as u32;
        let entry = self.labels.entry(label.to_string()).or_default();
        entry.address = Some(address);
        let fixups = std::mem::take(&mut entry.fixups);
        for index in fixups {
            self.patch_jump(index, address);
        }
        address
    }

    pub fn label_address(&self, label: &str) -> Option<u32> {
        self.labels.get(label).and_then(|l| l.address)
    }

    // ---- constant pool (deduplicated) ----

    fn add_constant(&mut self, constant: Constant) -> u32 {
        if let Some(index) = self.constants.iter().position(|c| c == &constant) {
            return index as u32;
        }
        let index = self.constants.len() as u32;
        self.constants.push(constant);
        index
    }

    pub fn add_const_int(&mut self, value: i32) -> u32 {
        self.add_constant(Constant::Int(value))
    }

    pub fn add_const_real(&mut self, value: f64) -> u32 {
        self.add_constant(Constant::Real(value))
    }

    pub fn add_const_bool(&mut self, value: bool) -> u32 {
        self.add_constant(Constant::Bool(value))
    }

    pub fn add_const_string(&mut self, value: &str) -> u32 {
        self.add_constant(Constant::String(value.to_string()))
    }

    // ---- descriptor tables ----

    /// Register a variable; offsets are assigned sequentially per region.
    /// Returns the variable-table index.
    pub fn add_variable(
        &mut self,
        name: &str,
        type_id: u32,
        size: u32,
        is_global: bool,
    ) -> Result<u32, VmError> {
        if name.len() > MAX_NAME_LEN {
            return Err(VmError::validation(format!("variable name too long: {}", name)));
        }
        let offset = if is_global {
            let offset = self.next_global_offset;
            self.next_global_offset += size;
            offset
        } else {
            let offset = self.next_local_offset;
            self.next_local_offset += size;
            offset
        };
        let index = self.variables.len() as u32;
        self.variables.push(VarDescriptor {
            name: name.to_string(),
            type_id,
            offset,
            size,
            is_global,
        });
        Ok(index)
    }

    pub fn add_function(
        &mut self,
        name: &str,
        address: u32,
        param_count: u32,
        local_size: u32,
        return_type: u32,
    ) -> Result<u32, VmError> {
        if name.len() > MAX_NAME_LEN {
            return Err(VmError::validation(format!("function name too long: {}", name)));
        }
        let index = self.functions.len() as u32;
        self.functions.push(FuncDescriptor {
            name: name.to_string(),
            address,
            param_count,
            local_size,
            return_type,
        });
        Ok(index)
    }

    pub fn variable(&self, index: u32) -> Option<&VarDescriptor> {
        self.variables.get(index as usize)
    }

    /// Finalize into a validated bytecode file. Fails if any label was
    /// referenced but never marked.
    pub fn finish(self) -> Result<BytecodeFile, VmError> {
        for (name, label) in &self.labels {
            if label.address.is_none() && !label.fixups.is_empty() {
                return Err(VmError::validation(format!("unresolved label: {}", name)));
            }
        }

        let file = BytecodeFile {
            version: BYTECODE_VERSION,
            flags: self.flags,
            entry_point: self.entry_point,
            instructions: self.instructions,
            constants: self.constants,
            variables: self.variables,
            functions: self.functions,
        };
        file.validate()?;
        Ok(file)
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_pool_deduplicates_by_value() {
        let mut builder = BytecodeBuilder::new();
        let a = builder.add_const_int(42);
        let b = builder.add_const_int(42);
        let c = builder.add_const_int(43);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let s1 = builder.add_const_string("motor");
        let s2 = builder.add_const_string("motor");
        assert_eq!(s1, s2);

        // Same bits, different kinds must not collapse
        let int_one = builder.add_const_int(1);
        let bool_true = builder.add_const_bool(true);
        assert_ne!(int_one, bool_true);
    }

    #[test]
    fn labels_patch_forward_references() {
        let mut builder = BytecodeBuilder::new();
        builder.emit_int(OpCode::LoadConstBool, 0);
        let jump = builder.emit_jump_to(OpCode::JmpFalse, "exit");
        builder.emit(OpCode::Nop);
        let exit = builder.mark_label("exit");
        builder.emit(OpCode::Halt);

        let file = builder.finish().unwrap();
        assert_eq!(file.instructions[jump as usize].operand, Operand::Address(exit));
    }

    #[test]
    fn unresolved_label_fails_finish() {
        let mut builder = BytecodeBuilder::new();
        builder.emit_jump_to(OpCode::Jmp, "nowhere");
        builder.emit(OpCode::Halt);
        assert!(builder.finish().is_err());
    }

    #[test]
    fn variable_offsets_accumulate_per_region() {
        let mut builder = BytecodeBuilder::new();
        let g0 = builder.add_variable("a", 1, 2, true).unwrap();
        let g1 = builder.add_variable("b", 1, 1, true).unwrap();
        let l0 = builder.add_variable("tmp", 1, 1, false).unwrap();
        assert_eq!(builder.variable(g0).unwrap().offset, 0);
        assert_eq!(builder.variable(g1).unwrap().offset, 2);
        assert_eq!(builder.variable(l0).unwrap().offset, 0);
    }

    #[test]
    fn long_names_are_rejected() {
        let mut builder = BytecodeBuilder::new();
        let name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(builder.add_variable(&name, 1, 1, true).is_err());
        assert!(builder.add_function(&name, 0, 0, 0, 0).is_err());
    }

    #[test]
    fn finish_runs_the_validator() {
        let mut builder = BytecodeBuilder::new();
        builder.emit_addr(OpCode::Jmp, 500);
        builder.emit(OpCode::Halt);
        assert!(builder.finish().is_err());
    }
}
