// File: src/vm.rs
//
// Virtual machine for executing ST bytecode.
// Stack-based fetch-decode-execute loop over typed values, with
// global/local/parameter memory regions, a native call bridge, debug
// support (breakpoints, single-step) and cooperative hooks for the
// primary/secondary sync engine.

use crate::bytecode::{
    BytecodeFile, Constant, FuncDescriptor, Instruction, OpCode, Operand, VarDescriptor,
};
use crate::errors::{SourceLocation, VmError, VmErrorKind};
use crate::library::LibraryManager;
use crate::stack::{CallFrame, CallStack, OperandStack, MAX_STACK_SIZE};
use crate::sync::{NodeRole, SyncConfig, SyncEngine};
use crate::value::{Value, ValueTag};
use ahash::{AHashMap, AHashSet};
use std::fmt;
use std::time::{Duration, Instant};

/// Global variable region capacity
pub const MAX_GLOBAL_VARS: usize = 500;

/// Local variable region capacity, shared by all active frames
pub const MAX_LOCAL_VARS: usize = 100;

/// Instructions between cooperative sync passes
const SYNC_POLL_INTERVAL: u64 = 8;

/// Instructions between execution-budget checks
const BUDGET_CHECK_INTERVAL: u64 = 64;

/// Top-level VM states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Init,
    Running,
    Paused,
    Stopped,
    Error,
    SyncWait,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            VmState::Init => "INIT",
            VmState::Running => "RUNNING",
            VmState::Paused => "PAUSED",
            VmState::Stopped => "STOPPED",
            VmState::Error => "ERROR",
            VmState::SyncWait => "SYNC_WAIT",
        };
        write!(f, "{}", text)
    }
}

/// Replication role of this VM instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    None,
    Primary,
    Secondary,
}

/// Host-facing configuration
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub enable_debug: bool,
    /// Total execution budget in milliseconds; 0 means unlimited
    pub max_execution_time_ms: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { enable_debug: false, max_execution_time_ms: 0 }
    }
}

/// Breakpoints, single-step state and current source position
#[derive(Debug, Default)]
pub struct DebugInfo {
    pub enabled: bool,
    breakpoints: AHashSet<u32>,
    pub step_mode: bool,
    pub current_line: u32,
    pub current_column: u32,
}

/// Execution counters, incremented inline by the dispatch loop
#[derive(Debug, Default, Clone)]
pub struct VmStatistics {
    pub instructions_executed: u64,
    pub function_calls: u64,
    pub library_calls: u64,
    pub sync_operations: u64,
    pub runtime_errors: u64,
    pub execution_time_ms: u64,
}

/// The ST virtual machine
pub struct Vm {
    // Immutable post-load
    instructions: Vec<Instruction>,
    constants: Vec<Constant>,
    variables: Vec<VarDescriptor>,
    functions: Vec<FuncDescriptor>,
    func_by_address: AHashMap<u32, usize>,
    entry_point: u32,

    // Runtime state
    pc: u32,
    state: VmState,
    operand_stack: OperandStack,
    call_stack: CallStack,

    // Memory regions
    globals: Vec<Value>,
    locals: Vec<Value>,
    /// Next free slot in the local region; slides at CALL/RET
    locals_top: usize,
    /// Slots reserved for the main program's locals
    main_local_size: usize,

    lib_mgr: LibraryManager,

    // Sync
    sync: Option<SyncEngine>,
    sync_mode: SyncMode,

    debug: DebugInfo,
    stats: VmStatistics,

    last_error: Option<VmError>,
    config: VmConfig,
    started_at: Option<Instant>,
    /// Set when a breakpoint pause must not re-trigger on resume
    resume_skip: bool,
    loaded: bool,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let debug = DebugInfo { enabled: config.enable_debug, ..DebugInfo::default() };
        Self {
            instructions: Vec::new(),
            constants: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
            func_by_address: AHashMap::new(),
            entry_point: 0,
            pc: 0,
            state: VmState::Init,
            operand_stack: OperandStack::new(),
            call_stack: CallStack::new(),
            globals: vec![Value::Undefined; MAX_GLOBAL_VARS],
            locals: vec![Value::Undefined; MAX_LOCAL_VARS],
            locals_top: 0,
            main_local_size: 0,
            lib_mgr: LibraryManager::with_defaults(),
            sync: None,
            sync_mode: SyncMode::None,
            debug,
            stats: VmStatistics::default(),
            last_error: None,
            config,
            started_at: None,
            resume_skip: false,
            loaded: false,
        }
    }

    pub fn set_library_manager(&mut self, lib_mgr: LibraryManager) {
        self.lib_mgr = lib_mgr;
    }

    // ---- loading ----

    /// Validate and load a bytecode file: copy the immutable sections,
    /// build the function-address index and zero-initialize the globals
    /// declared by the variable table.
    pub fn load(&mut self, file: &BytecodeFile) -> Result<(), VmError> {
        file.validate()?;

        self.instructions = file.instructions.clone();
        self.constants = file.constants.clone();
        self.variables = file.variables.clone();
        self.functions = file.functions.clone();
        self.entry_point = file.entry_point;

        self.func_by_address =
            self.functions.iter().enumerate().map(|(i, f)| (f.address, i)).collect();

        for var in self.variables.iter().filter(|v| v.is_global) {
            let tag = ValueTag::try_from(var.type_id).unwrap_or(ValueTag::Undefined);
            for slot in var.offset..var.offset + var.size {
                if (slot as usize) < self.globals.len() {
                    self.globals[slot as usize] = Value::zero_of(tag);
                }
            }
        }

        // A descriptor at the entry point describes the main block; its
        // locals sit below every call frame.
        self.main_local_size = self
            .func_by_address
            .get(&file.entry_point)
            .map(|&i| self.functions[i].local_size as usize)
            .unwrap_or(0);
        self.locals_top = self.main_local_size;

        self.pc = self.entry_point;
        self.state = VmState::Init;
        self.loaded = true;
        Ok(())
    }

    /// Return the VM to its post-load state, clearing stacks, memory and
    /// the error latch
    pub fn reset(&mut self) {
        self.pc = self.entry_point;
        self.operand_stack.clear();
        self.call_stack.clear();
        self.locals = vec![Value::Undefined; MAX_LOCAL_VARS];
        self.locals_top = self.main_local_size;
        for slot in self.globals.iter_mut() {
            *slot = Value::Undefined;
        }
        for var in self.variables.clone().iter().filter(|v| v.is_global) {
            let tag = ValueTag::try_from(var.type_id).unwrap_or(ValueTag::Undefined);
            for slot in var.offset..var.offset + var.size {
                if (slot as usize) < self.globals.len() {
                    self.globals[slot as usize] = Value::zero_of(tag);
                }
            }
        }
        self.last_error = None;
        self.resume_skip = false;
        self.state = if self.loaded { VmState::Init } else { self.state };
    }

    // ---- execution control ----

    /// Run from the current pc until HALT, an outer RET, a pause, or a
    /// fatal error
    pub fn execute(&mut self) -> Result<(), VmError> {
        if !self.loaded {
            return Err(VmError::runtime("no bytecode loaded"));
        }
        if self.state == VmState::Error {
            return Err(self.last_error.clone().unwrap_or_else(|| VmError::runtime("VM in error state")));
        }
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.state = VmState::Running;
        let run_started = Instant::now();
        let result = self.run_loop();
        self.stats.execution_time_ms += run_started.elapsed().as_millis() as u64;
        result
    }

    fn run_loop(&mut self) -> Result<(), VmError> {
        loop {
            match self.state {
                VmState::Running => self.step_internal()?,
                VmState::SyncWait => {
                    // Secondary blocked on a checkpoint; keep the sync
                    // engine breathing until one is applied. The
                    // execution budget still applies while waiting.
                    if self.config.max_execution_time_ms > 0 {
                        if let Some(started) = self.started_at {
                            if started.elapsed().as_millis() as u64 > self.config.max_execution_time_ms {
                                let err = VmError::new(
                                    VmErrorKind::Timeout,
                                    format!(
                                        "execution budget of {} ms exceeded",
                                        self.config.max_execution_time_ms
                                    ),
                                );
                                return Err(self.fail(err));
                            }
                        }
                    }
                    self.process_sync_messages();
                    if self.state == VmState::SyncWait {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Execute exactly one instruction (single-step from Paused)
    pub fn step(&mut self) -> Result<(), VmError> {
        if self.state != VmState::Paused && self.state != VmState::Init {
            return Err(VmError::runtime(format!("cannot step from state {}", self.state)));
        }
        self.state = VmState::Running;
        self.resume_skip = true;
        self.step_internal()?;
        if self.state == VmState::Running {
            self.state = VmState::Paused;
        }
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state == VmState::Running {
            self.state = VmState::Paused;
        }
    }

    pub fn resume(&mut self) -> Result<(), VmError> {
        if self.state != VmState::Paused {
            return Err(VmError::runtime(format!("cannot resume from state {}", self.state)));
        }
        self.state = VmState::Running;
        self.resume_skip = true;
        self.run_loop()
    }

    pub fn stop(&mut self) {
        self.state = VmState::Stopped;
    }

    fn step_internal(&mut self) -> Result<(), VmError> {
        let executed = self.stats.instructions_executed;

        if self.config.max_execution_time_ms > 0 && executed % BUDGET_CHECK_INTERVAL == 0 {
            if let Some(started) = self.started_at {
                if started.elapsed().as_millis() as u64 > self.config.max_execution_time_ms {
                    let err = VmError::new(
                        VmErrorKind::Timeout,
                        format!("execution budget of {} ms exceeded", self.config.max_execution_time_ms),
                    );
                    return Err(self.fail(err));
                }
            }
        }

        if self.sync.is_some() && executed % SYNC_POLL_INTERVAL == 0 {
            self.process_sync_messages();
            if self.state != VmState::Running {
                return Ok(());
            }
        }

        if self.pc as usize >= self.instructions.len() {
            let err = VmError::runtime(format!("program counter {} out of range", self.pc));
            return Err(self.fail(err));
        }

        // Debug gate: pause before executing a breakpointed instruction
        if self.debug.enabled && !self.resume_skip && self.debug.breakpoints.contains(&self.pc) {
            self.state = VmState::Paused;
            return Ok(());
        }
        self.resume_skip = false;

        let instr = self.instructions[self.pc as usize].clone();
        if instr.source_line != 0 {
            self.debug.current_line = instr.source_line;
            self.debug.current_column = instr.source_column;
        }

        match self.execute_instruction(&instr) {
            Ok(()) => {
                self.stats.instructions_executed += 1;
                if self.debug.enabled && self.debug.step_mode && self.state == VmState::Running {
                    self.state = VmState::Paused;
                }
                Ok(())
            }
            Err(err) => {
                let located = if err.location.is_known() {
                    err
                } else {
                    err.at(SourceLocation::new(instr.source_line, instr.source_column))
                };
                Err(self.fail(located))
            }
        }
    }

    /// Latch a fatal error: record it, count it, transition to Error.
    /// The pc is left pointing at the faulting instruction.
    fn fail(&mut self, err: VmError) -> VmError {
        self.stats.runtime_errors += 1;
        self.last_error = Some(err.clone());
        self.state = VmState::Error;
        err
    }

    // ---- typed stack helpers ----

    fn pop_int(&mut self) -> Result<i32, VmError> {
        match self.operand_stack.pop()? {
            Value::Int(i) => Ok(i),
            other => Err(VmError::type_error(format!("expected INT operand, got {}", other.type_name()))),
        }
    }

    fn pop_real(&mut self) -> Result<f64, VmError> {
        match self.operand_stack.pop()? {
            Value::Real(r) => Ok(r),
            other => Err(VmError::type_error(format!("expected REAL operand, got {}", other.type_name()))),
        }
    }

    fn pop_bool(&mut self) -> Result<bool, VmError> {
        match self.operand_stack.pop()? {
            Value::Bool(b) => Ok(b),
            other => Err(VmError::type_error(format!("expected BOOL operand, got {}", other.type_name()))),
        }
    }

    fn pop_string(&mut self) -> Result<String, VmError> {
        match self.operand_stack.pop()? {
            Value::String(s) => Ok(s),
            other => Err(VmError::type_error(format!("expected STRING operand, got {}", other.type_name()))),
        }
    }

    // ---- memory helpers ----

    fn frame_local_base(&self) -> usize {
        self.call_stack.top().map(|f| f.local_base).unwrap_or(0)
    }

    fn load_slot(locals: &[Value], index: usize, what: &str) -> Result<Value, VmError> {
        match locals.get(index) {
            Some(Value::Undefined) => Err(VmError::new(
                VmErrorKind::UndefinedVariable,
                format!("read of uninitialized {} slot {}", what, index),
            )),
            Some(value) => Ok(value.clone()),
            None => Err(VmError::new(
                VmErrorKind::IndexOutOfRange,
                format!("{} index {} out of range", what, index),
            )),
        }
    }

    fn store_local_slot(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::new(
                VmErrorKind::IndexOutOfRange,
                format!("local index {} out of range", index),
            )),
        }
    }

    fn store_global_slot(&mut self, index: u32, value: Value) -> Result<(), VmError> {
        match self.globals.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                self.mark_sync_dirty(index);
                Ok(())
            }
            None => Err(VmError::new(
                VmErrorKind::IndexOutOfRange,
                format!("global index {} out of range", index),
            )),
        }
    }

    // ---- dispatch ----

    fn execute_instruction(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let mut next_pc = self.pc + 1;

        match (instr.opcode, instr.operand) {
            (OpCode::Nop, _) => {}
            (OpCode::Halt, _) => {
                self.state = VmState::Stopped;
            }

            // Constant loads
            (OpCode::LoadConstInt, Operand::Int(i)) => {
                self.operand_stack.push(Value::Int(i))?;
            }
            (OpCode::LoadConstReal, Operand::Real(r)) => {
                self.operand_stack.push(Value::Real(r))?;
            }
            (OpCode::LoadConstBool, Operand::Int(i)) => {
                self.operand_stack.push(Value::Bool(i != 0))?;
            }
            (OpCode::LoadConstString, Operand::StrIndex(index)) => {
                // Validation pinned this to a string entry; the runtime
                // value owns its own copy of the bytes.
                let value = self.constants[index as usize].to_value();
                self.operand_stack.push(value)?;
            }

            // Variable loads and stores
            (OpCode::LoadLocal, Operand::Int(offset)) => {
                let index = self.frame_local_base() + offset as usize;
                let value = Self::load_slot(&self.locals, index, "local")?;
                self.operand_stack.push(value)?;
            }
            (OpCode::StoreLocal, Operand::Int(offset)) => {
                let index = self.frame_local_base() + offset as usize;
                let value = self.operand_stack.pop()?;
                self.store_local_slot(index, value)?;
            }
            (OpCode::LoadGlobal, Operand::Int(index)) => {
                let value = Self::load_slot(&self.globals, index as usize, "global")?;
                self.operand_stack.push(value)?;
            }
            (OpCode::StoreGlobal, Operand::Int(index)) => {
                let value = self.operand_stack.pop()?;
                self.store_global_slot(index as u32, value)?;
            }
            (OpCode::LoadParam, Operand::Int(offset)) => {
                let frame = self
                    .call_stack
                    .top()
                    .ok_or_else(|| VmError::runtime("LOAD_PARAM outside a function"))?;
                if offset as u32 >= frame.param_count {
                    return Err(VmError::new(
                        VmErrorKind::IndexOutOfRange,
                        format!("parameter index {} out of range", offset),
                    ));
                }
                let index = frame.param_base + offset as usize;
                let value = Self::load_slot(&self.locals, index, "parameter")?;
                self.operand_stack.push(value)?;
            }
            (OpCode::StoreParam, Operand::Int(offset)) => {
                let frame = self
                    .call_stack
                    .top()
                    .ok_or_else(|| VmError::runtime("STORE_PARAM outside a function"))?;
                if offset as u32 >= frame.param_count {
                    return Err(VmError::new(
                        VmErrorKind::IndexOutOfRange,
                        format!("parameter index {} out of range", offset),
                    ));
                }
                let index = frame.param_base + offset as usize;
                let value = self.operand_stack.pop()?;
                self.store_local_slot(index, value)?;
            }

            // Stack manipulation
            (OpCode::Push, _) => {
                self.operand_stack.push(Value::Int(0))?;
            }
            (OpCode::Pop, _) => {
                self.operand_stack.pop()?;
            }
            (OpCode::Dup, _) => {
                let value = self.operand_stack.peek(0)?.clone();
                self.operand_stack.push(value)?;
            }
            (OpCode::Swap, _) => {
                self.operand_stack.swap_top()?;
            }

            // Integer arithmetic: wrapping two's-complement, fatal zero divisor
            (OpCode::AddInt, _) => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.operand_stack.push(Value::Int(a.wrapping_add(b)))?;
            }
            (OpCode::SubInt, _) => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.operand_stack.push(Value::Int(a.wrapping_sub(b)))?;
            }
            (OpCode::MulInt, _) => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.operand_stack.push(Value::Int(a.wrapping_mul(b)))?;
            }
            (OpCode::DivInt, _) => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b == 0 {
                    return Err(VmError::new(VmErrorKind::DivisionByZero, "integer division by zero"));
                }
                self.operand_stack.push(Value::Int(a.wrapping_div(b)))?;
            }
            (OpCode::ModInt, _) => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b == 0 {
                    return Err(VmError::new(VmErrorKind::DivisionByZero, "integer modulo by zero"));
                }
                self.operand_stack.push(Value::Int(a.wrapping_rem(b)))?;
            }
            (OpCode::NegInt, _) => {
                let a = self.pop_int()?;
                self.operand_stack.push(Value::Int(a.wrapping_neg()))?;
            }

            // Real arithmetic: IEEE-754, no traps on NaN/infinity
            (OpCode::AddReal, _) => {
                let b = self.pop_real()?;
                let a = self.pop_real()?;
                self.operand_stack.push(Value::Real(a + b))?;
            }
            (OpCode::SubReal, _) => {
                let b = self.pop_real()?;
                let a = self.pop_real()?;
                self.operand_stack.push(Value::Real(a - b))?;
            }
            (OpCode::MulReal, _) => {
                let b = self.pop_real()?;
                let a = self.pop_real()?;
                self.operand_stack.push(Value::Real(a * b))?;
            }
            (OpCode::DivReal, _) => {
                let b = self.pop_real()?;
                let a = self.pop_real()?;
                self.operand_stack.push(Value::Real(a / b))?;
            }
            (OpCode::NegReal, _) => {
                let a = self.pop_real()?;
                self.operand_stack.push(Value::Real(-a))?;
            }

            // Boolean logic: strict evaluation, both operands popped
            (OpCode::AndBool, _) => {
                let b = self.pop_bool()?;
                let a = self.pop_bool()?;
                self.operand_stack.push(Value::Bool(a && b))?;
            }
            (OpCode::OrBool, _) => {
                let b = self.pop_bool()?;
                let a = self.pop_bool()?;
                self.operand_stack.push(Value::Bool(a || b))?;
            }
            (OpCode::XorBool, _) => {
                let b = self.pop_bool()?;
                let a = self.pop_bool()?;
                self.operand_stack.push(Value::Bool(a ^ b))?;
            }
            (OpCode::NotBool, _) => {
                let a = self.pop_bool()?;
                self.operand_stack.push(Value::Bool(!a))?;
            }

            // Comparisons
            (OpCode::EqInt, _) => self.compare_int(|o| o == std::cmp::Ordering::Equal)?,
            (OpCode::NeInt, _) => self.compare_int(|o| o != std::cmp::Ordering::Equal)?,
            (OpCode::LtInt, _) => self.compare_int(|o| o == std::cmp::Ordering::Less)?,
            (OpCode::LeInt, _) => self.compare_int(|o| o != std::cmp::Ordering::Greater)?,
            (OpCode::GtInt, _) => self.compare_int(|o| o == std::cmp::Ordering::Greater)?,
            (OpCode::GeInt, _) => self.compare_int(|o| o != std::cmp::Ordering::Less)?,

            (OpCode::EqReal, _) => self.compare_real(|a, b| a == b)?,
            (OpCode::NeReal, _) => self.compare_real(|a, b| a != b)?,
            (OpCode::LtReal, _) => self.compare_real(|a, b| a < b)?,
            (OpCode::LeReal, _) => self.compare_real(|a, b| a <= b)?,
            (OpCode::GtReal, _) => self.compare_real(|a, b| a > b)?,
            (OpCode::GeReal, _) => self.compare_real(|a, b| a >= b)?,

            (OpCode::EqString, _) => self.compare_string(|o| o == std::cmp::Ordering::Equal)?,
            (OpCode::NeString, _) => self.compare_string(|o| o != std::cmp::Ordering::Equal)?,
            (OpCode::LtString, _) => self.compare_string(|o| o == std::cmp::Ordering::Less)?,
            (OpCode::LeString, _) => self.compare_string(|o| o != std::cmp::Ordering::Greater)?,
            (OpCode::GtString, _) => self.compare_string(|o| o == std::cmp::Ordering::Greater)?,
            (OpCode::GeString, _) => self.compare_string(|o| o != std::cmp::Ordering::Less)?,

            // Type conversions
            (OpCode::IntToReal, _) => {
                let a = self.pop_int()?;
                self.operand_stack.push(Value::Real(a as f64))?;
            }
            (OpCode::RealToInt, _) => {
                let a = self.pop_real()?;
                let truncated = a.trunc();
                if truncated.is_nan() || truncated < i32::MIN as f64 || truncated > i32::MAX as f64 {
                    return Err(VmError::new(
                        VmErrorKind::ConversionError,
                        format!("REAL value {} out of INT range", a),
                    ));
                }
                self.operand_stack.push(Value::Int(truncated as i32))?;
            }
            (OpCode::IntToString, _) => {
                let a = self.pop_int()?;
                self.operand_stack.push(Value::String(a.to_string()))?;
            }
            (OpCode::RealToString, _) => {
                let a = self.pop_real()?;
                self.operand_stack.push(Value::String(a.to_string()))?;
            }
            (OpCode::BoolToString, _) => {
                let a = self.pop_bool()?;
                self.operand_stack
                    .push(Value::String(if a { "TRUE".into() } else { "FALSE".into() }))?;
            }
            (OpCode::StringToInt, _) => {
                let s = self.pop_string()?;
                let parsed = s.trim().parse::<i32>().map_err(|_| {
                    VmError::new(VmErrorKind::ConversionError, format!("cannot parse {:?} as INT", s))
                })?;
                self.operand_stack.push(Value::Int(parsed))?;
            }
            (OpCode::StringToReal, _) => {
                let s = self.pop_string()?;
                let parsed = s.trim().parse::<f64>().map_err(|_| {
                    VmError::new(VmErrorKind::ConversionError, format!("cannot parse {:?} as REAL", s))
                })?;
                self.operand_stack.push(Value::Real(parsed))?;
            }

            // Control flow
            (OpCode::Jmp, Operand::Address(addr)) => {
                next_pc = addr;
            }
            (OpCode::JmpTrue, Operand::Address(addr)) => {
                if self.pop_bool()? {
                    next_pc = addr;
                }
            }
            (OpCode::JmpFalse, Operand::Address(addr)) => {
                if !self.pop_bool()? {
                    next_pc = addr;
                }
            }
            (OpCode::JmpEq, Operand::Address(addr)) => {
                if self.pop_equal_pair()? {
                    next_pc = addr;
                }
            }
            (OpCode::JmpNe, Operand::Address(addr)) => {
                if !self.pop_equal_pair()? {
                    next_pc = addr;
                }
            }

            // Calls and returns
            (OpCode::Call, Operand::Address(addr)) => {
                next_pc = self.enter_function(addr)?;
            }
            (OpCode::CallBuiltin, Operand::Int(index)) => {
                self.call_native(index as u32, true)?;
            }
            (OpCode::CallLibrary, Operand::Int(index)) => {
                self.call_native(index as u32, false)?;
            }
            (OpCode::Ret, _) => {
                next_pc = self.leave_function()?;
            }
            (OpCode::RetValue, _) => {
                // The return value stays on the operand stack across the
                // frame pop.
                self.operand_stack.peek(0)?;
                next_pc = self.leave_function()?;
            }

            // Aggregate access
            (OpCode::ArrayLoad, _) => {
                let index = self.pop_int()?;
                let base = self.pop_int()?;
                let slot = checked_slot(base, index)?;
                let value = Self::load_slot(&self.globals, slot, "global")?;
                self.operand_stack.push(value)?;
            }
            (OpCode::ArrayStore, _) => {
                let value = self.operand_stack.pop()?;
                let index = self.pop_int()?;
                let base = self.pop_int()?;
                let slot = checked_slot(base, index)?;
                self.store_global_slot(slot as u32, value)?;
            }
            (OpCode::ArrayLen, _) => {
                let table_index = self.pop_int()?;
                let descriptor = self.variables.get(table_index as usize).ok_or_else(|| {
                    VmError::new(
                        VmErrorKind::IndexOutOfRange,
                        format!("variable table index {} out of range", table_index),
                    )
                })?;
                self.operand_stack.push(Value::Int(descriptor.size as i32))?;
            }
            (OpCode::StructLoad, Operand::Int(slot)) => {
                let value = Self::load_slot(&self.globals, slot as usize, "global")?;
                self.operand_stack.push(value)?;
            }
            (OpCode::StructStore, Operand::Int(slot)) => {
                let value = self.operand_stack.pop()?;
                self.store_global_slot(slot as u32, value)?;
            }

            // Debug
            (OpCode::DebugPrint, _) => {
                let value = self.operand_stack.pop()?;
                println!("{}", value);
            }
            (OpCode::Breakpoint, Operand::Int(_)) => {
                if self.debug.enabled {
                    self.state = VmState::Paused;
                }
            }
            (OpCode::LineInfo, Operand::Int(line)) => {
                self.debug.current_line = line as u32;
            }

            // Sync
            (OpCode::SyncVar, Operand::Int(index)) => {
                self.mark_sync_dirty(index as u32);
                self.stats.sync_operations += 1;
            }
            (OpCode::SyncCheckpoint, _) => {
                self.stats.sync_operations += 1;
                match self.sync_mode {
                    SyncMode::Primary => {
                        if let Some(mut engine) = self.sync.take() {
                            engine.send_checkpoint(self);
                            self.sync = Some(engine);
                        }
                    }
                    SyncMode::Secondary => {
                        if self.sync.is_some() {
                            self.state = VmState::SyncWait;
                        }
                    }
                    SyncMode::None => {}
                }
            }

            // The validator guarantees operand kinds; reaching this arm
            // means the file bypassed validation.
            (opcode, operand) => {
                return Err(VmError::runtime(format!(
                    "invalid operand {:?} for {}",
                    operand,
                    opcode.mnemonic()
                )));
            }
        }

        self.pc = next_pc;
        Ok(())
    }

    fn compare_int(&mut self, accept: fn(std::cmp::Ordering) -> bool) -> Result<(), VmError> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.operand_stack.push(Value::Bool(accept(a.cmp(&b))))
    }

    fn compare_real(&mut self, accept: fn(f64, f64) -> bool) -> Result<(), VmError> {
        let b = self.pop_real()?;
        let a = self.pop_real()?;
        self.operand_stack.push(Value::Bool(accept(a, b)))
    }

    fn compare_string(&mut self, accept: fn(std::cmp::Ordering) -> bool) -> Result<(), VmError> {
        let b = self.pop_string()?;
        let a = self.pop_string()?;
        self.operand_stack
            .push(Value::Bool(accept(a.as_bytes().cmp(b.as_bytes()))))
    }

    /// Pop two values and compare with the EQ rules for their type; the
    /// operand types must match.
    fn pop_equal_pair(&mut self) -> Result<bool, VmError> {
        let b = self.operand_stack.pop()?;
        let a = self.operand_stack.pop()?;
        if a.tag() != b.tag() {
            return Err(VmError::type_error(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            )));
        }
        Ok(a == b)
    }

    fn enter_function(&mut self, addr: u32) -> Result<u32, VmError> {
        let func_index = *self.func_by_address.get(&addr).ok_or_else(|| {
            VmError::runtime(format!("CALL target {} is not a function entry", addr))
        })?;
        let func = self.functions[func_index].clone();

        let local_base = self.locals_top;
        let param_base = local_base + func.local_size as usize;
        let frame_end = param_base + func.param_count as usize;
        if frame_end > self.locals.len() {
            return Err(VmError::new(
                VmErrorKind::IndexOutOfRange,
                format!("local region exhausted calling {}", func.name),
            ));
        }

        // Fresh frames start with uninitialized locals
        for slot in local_base..param_base {
            self.locals[slot] = Value::Undefined;
        }

        // Arguments were pushed in order; pop into the parameter region in
        // reverse so parameter 0 is the first argument.
        for offset in (0..func.param_count as usize).rev() {
            let value = self.operand_stack.pop().map_err(|_| {
                VmError::runtime(format!(
                    "missing argument {} calling {}",
                    offset, func.name
                ))
            })?;
            self.locals[param_base + offset] = value;
        }

        self.call_stack.push(CallFrame {
            return_address: self.pc + 1,
            local_base,
            param_base,
            param_count: func.param_count,
            function_name: func.name.clone(),
        })?;
        self.locals_top = frame_end;
        self.stats.function_calls += 1;
        Ok(addr)
    }

    fn leave_function(&mut self) -> Result<u32, VmError> {
        match self.call_stack.pop() {
            Some(frame) => {
                self.locals_top = frame.local_base;
                Ok(frame.return_address)
            }
            None => {
                // RET at depth zero terminates the program
                self.state = VmState::Stopped;
                Ok(self.pc + 1)
            }
        }
    }

    fn call_native(&mut self, index: u32, builtin: bool) -> Result<(), VmError> {
        let (name, arity, handler) = {
            let entry = if builtin {
                self.lib_mgr.builtin(index)
            } else {
                self.lib_mgr.library_fn(index)
            };
            let entry = entry.ok_or_else(|| {
                VmError::runtime(format!(
                    "unknown {} function index {}",
                    if builtin { "builtin" } else { "library" },
                    index
                ))
            })?;
            (entry.name, entry.arity, entry.handler)
        };

        // Peel the arguments off the stack preserving push order
        let mut args = vec![Value::Undefined; arity as usize];
        for offset in (0..arity as usize).rev() {
            args[offset] = self.operand_stack.pop().map_err(|_| {
                VmError::runtime(format!("missing argument {} calling {}", offset, name))
            })?;
        }

        self.stats.library_calls += 1;
        match handler(&args) {
            Ok(Some(result)) => self.operand_stack.push(result),
            Ok(None) => Ok(()),
            Err(message) => Err(VmError::runtime(format!("{}: {}", name, message))),
        }
    }

    // ---- sync integration ----

    /// Enable primary/secondary replication. Binds the sync socket and
    /// registers every global variable descriptor as a sync variable.
    pub fn enable_sync(&mut self, config: SyncConfig, mode: SyncMode) -> Result<(), VmError> {
        let role = match mode {
            SyncMode::Primary => NodeRole::Primary,
            SyncMode::Secondary => NodeRole::Secondary,
            SyncMode::None => NodeRole::Standalone,
        };
        let mut engine = SyncEngine::new(config, role)?;
        for var in self.variables.iter().filter(|v| v.is_global) {
            let tag = ValueTag::try_from(var.type_id).unwrap_or(ValueTag::Undefined);
            engine.register_variable(&var.name, var.offset, tag, var.size)?;
        }
        self.sync = Some(engine);
        self.sync_mode = mode;
        Ok(())
    }

    pub fn disable_sync(&mut self) {
        if let Some(engine) = self.sync.take() {
            engine.shutdown();
        }
        self.sync_mode = SyncMode::None;
    }

    pub fn register_sync_variable(&mut self, name: &str, index: u32) -> Result<(), VmError> {
        let tag = self.globals.get(index as usize).map(|v| v.tag()).unwrap_or(ValueTag::Undefined);
        match self.sync.as_mut() {
            Some(engine) => engine.register_variable(name, index, tag, 1),
            None => Err(VmError::sync("sync is not enabled")),
        }
    }

    /// One cooperative sync pass: drain datagrams, check peer health,
    /// emit heartbeat/checkpoint if due, flush dirty variables. Called
    /// between instructions, never inside a handler.
    pub fn process_sync_messages(&mut self) {
        if let Some(mut engine) = self.sync.take() {
            engine.process(self);
            self.sync = Some(engine);
        }
    }

    fn mark_sync_dirty(&mut self, index: u32) {
        if let Some(engine) = self.sync.as_mut() {
            engine.mark_dirty(index);
        }
    }

    pub(crate) fn checkpoint_applied(&mut self) {
        if self.state == VmState::SyncWait {
            self.state = VmState::Running;
        }
    }

    /// Apply a replicated value to a global slot without re-marking it
    /// dirty (the write originates from the peer)
    pub(crate) fn apply_synced_global(&mut self, index: u32, value: Value) {
        if let Some(slot) = self.globals.get_mut(index as usize) {
            *slot = value;
        }
    }

    // ---- accessors ----

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub(crate) fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    pub fn global(&self, index: u32) -> Option<&Value> {
        self.globals.get(index as usize)
    }

    /// Host-side global write; marks the slot dirty like STORE_GLOBAL
    pub fn set_global(&mut self, index: u32, value: Value) -> Result<(), VmError> {
        self.store_global_slot(index, value)
    }

    pub fn stack_depth(&self) -> usize {
        self.operand_stack.len()
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.depth()
    }

    pub fn statistics(&self) -> &VmStatistics {
        &self.stats
    }

    pub fn last_error(&self) -> Option<&VmError> {
        self.last_error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.last_error.is_some()
    }

    pub fn sync_engine(&self) -> Option<&SyncEngine> {
        self.sync.as_ref()
    }

    pub fn current_line(&self) -> u32 {
        self.debug.current_line
    }

    pub fn current_function(&self) -> &str {
        self.call_stack.top().map(|f| f.function_name.as_str()).unwrap_or("main")
    }

    // ---- debug ----

    pub fn enable_debug(&mut self) {
        self.debug.enabled = true;
    }

    pub fn set_breakpoint(&mut self, address: u32) {
        self.debug.breakpoints.insert(address);
    }

    pub fn clear_breakpoint(&mut self, address: u32) {
        self.debug.breakpoints.remove(&address);
    }

    pub fn clear_all_breakpoints(&mut self) {
        self.debug.breakpoints.clear();
    }

    pub fn is_breakpoint(&self, address: u32) -> bool {
        self.debug.breakpoints.contains(&address)
    }

    pub fn set_step_mode(&mut self, enabled: bool) {
        self.debug.step_mode = enabled;
    }

    // ---- diagnostics ----

    pub fn print_statistics(&self) {
        println!("=== VM statistics ===");
        println!("Instructions executed: {}", self.stats.instructions_executed);
        println!("Function calls:        {}", self.stats.function_calls);
        println!("Library calls:         {}", self.stats.library_calls);
        println!("Sync operations:       {}", self.stats.sync_operations);
        println!("Runtime errors:        {}", self.stats.runtime_errors);
        println!("Execution time:        {} ms", self.stats.execution_time_ms);
    }

    pub fn print_memory_info(&self) {
        let globals_in_use = self.globals.iter().filter(|v| !v.is_undefined()).count();
        println!("=== Memory usage ===");
        println!("Globals in use:   {}/{}", globals_in_use, self.globals.len());
        println!("Locals reserved:  {}/{}", self.locals_top, self.locals.len());
        println!("Stack high water: {}/{}", self.operand_stack.high_water(), MAX_STACK_SIZE);
        println!("Call depth:       {}", self.call_stack.depth());
    }

    pub fn print_sync_status(&self) {
        match &self.sync {
            Some(engine) => engine.print_status(),
            None => println!("Sync: disabled"),
        }
    }

    pub fn print_stack(&self) {
        println!("=== Operand stack ({} values) ===", self.operand_stack.len());
        for (index, value) in self.operand_stack.values().iter().enumerate().rev() {
            println!("  [{}] {} ({})", index, value, value.type_name());
        }
    }

    pub fn print_call_stack(&self) {
        println!("=== Call stack (depth {}) ===", self.call_stack.depth());
        for frame in self.call_stack.frames().iter().rev() {
            println!(
                "  {} return={} locals@{} params@{}",
                frame.function_name, frame.return_address, frame.local_base, frame.param_base
            );
        }
    }

    pub fn print_variables(&self) {
        println!("=== Global variables ===");
        for var in self.variables.iter().filter(|v| v.is_global) {
            if let Some(value) = self.globals.get(var.offset as usize) {
                println!("  {} = {}", var.name, value);
            }
        }
    }
}

fn checked_slot(base: i32, index: i32) -> Result<usize, VmError> {
    let slot = base as i64 + index as i64;
    if slot < 0 || slot >= MAX_GLOBAL_VARS as i64 {
        return Err(VmError::new(
            VmErrorKind::IndexOutOfRange,
            format!("element index {} out of range", slot),
        ));
    }
    Ok(slot as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::BytecodeBuilder;

    fn run(build: impl FnOnce(&mut BytecodeBuilder)) -> Vm {
        let mut builder = BytecodeBuilder::new();
        build(&mut builder);
        let file = builder.finish().unwrap();
        let mut vm = Vm::new(VmConfig::default());
        vm.load(&file).unwrap();
        let _ = vm.execute();
        vm
    }

    #[test]
    fn arithmetic_stores_to_global() {
        // x := (3 + 4) * 2
        let vm = run(|b| {
            b.add_variable("x", ValueTag::Int as u32, 1, true).unwrap();
            b.emit_int(OpCode::LoadConstInt, 3);
            b.emit_int(OpCode::LoadConstInt, 4);
            b.emit(OpCode::AddInt);
            b.emit_int(OpCode::LoadConstInt, 2);
            b.emit(OpCode::MulInt);
            b.emit_int(OpCode::StoreGlobal, 0);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Stopped);
        assert_eq!(vm.global(0), Some(&Value::Int(14)));
        assert_eq!(vm.stack_depth(), 0);
    }

    #[test]
    fn while_loop_counts_to_three() {
        // i := 0; while i < 3 do i := i + 1
        let vm = run(|b| {
            b.add_variable("i", ValueTag::Int as u32, 1, true).unwrap();
            b.emit_int(OpCode::LoadConstInt, 0);
            b.emit_int(OpCode::StoreGlobal, 0);
            let head = b.mark_label("head");
            b.emit_int(OpCode::LoadGlobal, 0);
            b.emit_int(OpCode::LoadConstInt, 3);
            b.emit(OpCode::LtInt);
            b.emit_jump_to(OpCode::JmpFalse, "exit");
            b.emit_int(OpCode::LoadGlobal, 0);
            b.emit_int(OpCode::LoadConstInt, 1);
            b.emit(OpCode::AddInt);
            b.emit_int(OpCode::StoreGlobal, 0);
            b.emit_addr(OpCode::Jmp, head);
            b.mark_label("exit");
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Stopped);
        assert_eq!(vm.global(0), Some(&Value::Int(3)));
        assert!(!vm.has_error());
    }

    #[test]
    fn division_by_zero_latches_error_at_faulting_instruction() {
        let vm = run(|b| {
            b.emit_int(OpCode::LoadConstInt, 10);
            b.emit_int(OpCode::LoadConstInt, 0);
            b.emit(OpCode::DivInt); // address 2
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.pc(), 2);
        let err = vm.last_error().unwrap();
        assert_eq!(err.kind, VmErrorKind::DivisionByZero);
    }

    #[test]
    fn call_and_return_with_parameters() {
        // f(a, b) = a + b; x := f(5, 7)
        let vm = run(|b| {
            b.add_variable("x", ValueTag::Int as u32, 1, true).unwrap();
            // main at 0
            b.emit_int(OpCode::LoadConstInt, 5);
            b.emit_int(OpCode::LoadConstInt, 7);
            b.emit_jump_to(OpCode::Call, "f");
            b.emit_int(OpCode::StoreGlobal, 0);
            b.emit(OpCode::Halt);
            let f = b.mark_label("f");
            b.add_function("f", f, 2, 0, ValueTag::Int as u32).unwrap();
            b.emit_int(OpCode::LoadParam, 0);
            b.emit_int(OpCode::LoadParam, 1);
            b.emit(OpCode::AddInt);
            b.emit(OpCode::RetValue);
        });
        assert_eq!(vm.state(), VmState::Stopped);
        assert_eq!(vm.global(0), Some(&Value::Int(12)));
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn ret_at_depth_zero_terminates() {
        let vm = run(|b| {
            b.emit(OpCode::Nop);
            b.emit(OpCode::Ret);
        });
        assert_eq!(vm.state(), VmState::Stopped);
        assert!(!vm.has_error());
    }

    #[test]
    fn undefined_global_read_is_fatal() {
        let vm = run(|b| {
            // Slot 0 has no descriptor, so it stays Undefined
            b.emit_int(OpCode::LoadGlobal, 0);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.last_error().unwrap().kind, VmErrorKind::UndefinedVariable);
    }

    #[test]
    fn type_mismatch_in_arithmetic_is_fatal() {
        let vm = run(|b| {
            b.emit_int(OpCode::LoadConstInt, 1);
            b.emit_real(OpCode::LoadConstReal, 2.0);
            b.emit(OpCode::AddInt);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.last_error().unwrap().kind, VmErrorKind::TypeError);
    }

    #[test]
    fn conversions_follow_the_declared_rules() {
        let vm = run(|b| {
            b.add_variable("r", ValueTag::Real as u32, 1, true).unwrap();
            b.add_variable("i", ValueTag::Int as u32, 1, true).unwrap();
            b.emit_int(OpCode::LoadConstInt, 7);
            b.emit(OpCode::IntToReal);
            b.emit_int(OpCode::StoreGlobal, 0);
            b.emit_real(OpCode::LoadConstReal, -3.9);
            b.emit(OpCode::RealToInt); // truncates toward zero
            b.emit_int(OpCode::StoreGlobal, 1);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.global(0), Some(&Value::Real(7.0)));
        assert_eq!(vm.global(1), Some(&Value::Int(-3)));
    }

    #[test]
    fn string_parse_failure_is_fatal() {
        let vm = run(|b| {
            b.emit_str(OpCode::LoadConstString, "not a number");
            b.emit(OpCode::StringToInt);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.last_error().unwrap().kind, VmErrorKind::ConversionError);
    }

    #[test]
    fn integer_overflow_wraps_without_error() {
        let vm = run(|b| {
            b.add_variable("x", ValueTag::Int as u32, 1, true).unwrap();
            b.emit_int(OpCode::LoadConstInt, i32::MAX);
            b.emit_int(OpCode::LoadConstInt, 1);
            b.emit(OpCode::AddInt);
            b.emit_int(OpCode::StoreGlobal, 0);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Stopped);
        assert_eq!(vm.global(0), Some(&Value::Int(i32::MIN)));
    }

    #[test]
    fn builtin_call_pushes_result() {
        let vm = run(|b| {
            b.add_variable("x", ValueTag::Int as u32, 1, true).unwrap();
            b.emit_int(OpCode::LoadConstInt, -9);
            b.emit_int(OpCode::CallBuiltin, 1); // abs
            b.emit_int(OpCode::StoreGlobal, 0);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Stopped);
        assert_eq!(vm.global(0), Some(&Value::Int(9)));
    }

    #[test]
    fn library_call_reaches_time_functions() {
        let mgr = LibraryManager::with_defaults();
        let index = mgr.library_index("time_s").unwrap();
        let vm = run(move |b| {
            b.add_variable("t", ValueTag::Time as u32, 1, true).unwrap();
            b.emit_int(OpCode::LoadConstInt, 2);
            b.emit_int(OpCode::CallLibrary, index as i32);
            b.emit_int(OpCode::StoreGlobal, 0);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Stopped);
        assert_eq!(vm.global(0), Some(&Value::Time(2000)));
    }

    #[test]
    fn native_handler_error_is_fatal() {
        let vm = run(|b| {
            b.emit_int(OpCode::LoadConstInt, 1); // len expects STRING
            b.emit_int(OpCode::CallBuiltin, 5);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.last_error().unwrap().kind, VmErrorKind::RuntimeError);
    }

    #[test]
    fn breakpoint_pauses_then_resumes() {
        let mut builder = BytecodeBuilder::new();
        builder.add_variable("x", ValueTag::Int as u32, 1, true).unwrap();
        builder.emit_int(OpCode::LoadConstInt, 1);
        builder.emit_int(OpCode::StoreGlobal, 0); // address 1
        builder.emit(OpCode::Halt);
        let file = builder.finish().unwrap();

        let mut vm = Vm::new(VmConfig { enable_debug: true, ..VmConfig::default() });
        vm.load(&file).unwrap();
        vm.set_breakpoint(1);
        vm.execute().unwrap();
        assert_eq!(vm.state(), VmState::Paused);
        assert_eq!(vm.pc(), 1);
        assert_eq!(vm.global(0), Some(&Value::Int(0))); // store not yet executed

        vm.resume().unwrap();
        assert_eq!(vm.state(), VmState::Stopped);
        assert_eq!(vm.global(0), Some(&Value::Int(1)));
    }

    #[test]
    fn single_step_executes_one_instruction_at_a_time() {
        let mut builder = BytecodeBuilder::new();
        builder.emit_int(OpCode::LoadConstInt, 1);
        builder.emit(OpCode::Pop);
        builder.emit(OpCode::Halt);
        let file = builder.finish().unwrap();

        let mut vm = Vm::new(VmConfig { enable_debug: true, ..VmConfig::default() });
        vm.load(&file).unwrap();
        vm.step().unwrap();
        assert_eq!(vm.pc(), 1);
        assert_eq!(vm.state(), VmState::Paused);
        vm.step().unwrap();
        vm.step().unwrap();
        assert_eq!(vm.state(), VmState::Stopped);
    }

    #[test]
    fn determinism_across_runs() {
        let program = |b: &mut BytecodeBuilder| {
            b.add_variable("x", ValueTag::Int as u32, 1, true).unwrap();
            b.emit_int(OpCode::LoadConstInt, 12);
            b.emit_int(OpCode::LoadConstInt, 30);
            b.emit(OpCode::MulInt);
            b.emit_int(OpCode::StoreGlobal, 0);
            b.emit(OpCode::Halt);
        };
        let a = run(program);
        let b = run(program);
        assert_eq!(a.global(0), b.global(0));
    }

    #[test]
    fn statistics_count_instructions_and_calls() {
        let vm = run(|b| {
            b.emit_int(OpCode::LoadConstInt, 1);
            b.emit(OpCode::Pop);
            b.emit(OpCode::Halt);
        });
        assert_eq!(vm.statistics().instructions_executed, 3);
        assert_eq!(vm.statistics().runtime_errors, 0);
    }
}
