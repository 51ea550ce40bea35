// File: src/stack.rs
//
// Operand stack and call stack for the ST virtual machine.
// Both are fixed-capacity by design: exceeding a limit is a loud fatal
// error rather than a silent reallocation, preserving the real-time
// posture of the runtime.

use crate::errors::{VmError, VmErrorKind};
use crate::value::Value;

/// Default operand stack capacity
pub const MAX_STACK_SIZE: usize = 1000;

/// Default call stack capacity
pub const MAX_CALL_FRAMES: usize = 100;

/// Fixed-capacity operand stack of tagged runtime values
#[derive(Debug)]
pub struct OperandStack {
    data: Vec<Value>,
    capacity: usize,
    high_water: usize,
}

impl OperandStack {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STACK_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: Vec::with_capacity(capacity), capacity, high_water: 0 }
    }

    pub fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.data.len() >= self.capacity {
            return Err(VmError::new(VmErrorKind::StackOverflow, "operand stack overflow"));
        }
        self.data.push(value);
        if self.data.len() > self.high_water {
            self.high_water = self.data.len();
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.data
            .pop()
            .ok_or_else(|| VmError::new(VmErrorKind::StackUnderflow, "operand stack underflow"))
    }

    /// Peek at offset N from the top (0 is the top element)
    pub fn peek(&self, offset: usize) -> Result<&Value, VmError> {
        if offset >= self.data.len() {
            return Err(VmError::new(VmErrorKind::StackUnderflow, "operand stack underflow"));
        }
        Ok(&self.data[self.data.len() - 1 - offset])
    }

    pub fn top_mut(&mut self) -> Result<&mut Value, VmError> {
        self.data
            .last_mut()
            .ok_or_else(|| VmError::new(VmErrorKind::StackUnderflow, "operand stack underflow"))
    }

    pub fn swap_top(&mut self) -> Result<(), VmError> {
        let len = self.data.len();
        if len < 2 {
            return Err(VmError::new(VmErrorKind::StackUnderflow, "operand stack underflow"));
        }
        self.data.swap(len - 1, len - 2);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Read-only view for diagnostics printing
    pub fn values(&self) -> &[Value] {
        &self.data
    }
}

impl Default for OperandStack {
    fn default() -> Self {
        Self::new()
    }
}

/// State captured at a CALL and restored at RET
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Instruction index to resume at after return
    pub return_address: u32,
    /// Base index of this frame's locals within the local region
    pub local_base: usize,
    /// Base index of this frame's parameters within the local region
    pub param_base: usize,
    pub param_count: u32,
    /// Function name, kept for diagnostics only
    pub function_name: String,
}

/// Fixed-capacity stack of call frames; depth zero means the main program
#[derive(Debug)]
pub struct CallStack {
    frames: Vec<CallFrame>,
    capacity: usize,
}

impl CallStack {
    pub fn new() -> Self {
        Self { frames: Vec::with_capacity(MAX_CALL_FRAMES), capacity: MAX_CALL_FRAMES }
    }

    pub fn push(&mut self, frame: CallFrame) -> Result<(), VmError> {
        if self.frames.len() >= self.capacity {
            return Err(VmError::new(VmErrorKind::CallStackOverflow, "call stack overflow"));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_peek() {
        let mut stack = OperandStack::new();
        stack.push(Value::Int(1)).unwrap();
        stack.push(Value::Int(2)).unwrap();
        assert_eq!(stack.peek(0).unwrap(), &Value::Int(2));
        assert_eq!(stack.peek(1).unwrap(), &Value::Int(1));
        assert_eq!(stack.pop().unwrap(), Value::Int(2));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn underflow_is_fatal() {
        let mut stack = OperandStack::new();
        let err = stack.pop().unwrap_err();
        assert_eq!(err.kind, VmErrorKind::StackUnderflow);
    }

    #[test]
    fn overflow_is_fatal() {
        let mut stack = OperandStack::with_capacity(2);
        stack.push(Value::Int(1)).unwrap();
        stack.push(Value::Int(2)).unwrap();
        let err = stack.push(Value::Int(3)).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::StackOverflow);
    }

    #[test]
    fn call_stack_respects_capacity() {
        let mut calls = CallStack::new();
        for i in 0..MAX_CALL_FRAMES {
            calls
                .push(CallFrame {
                    return_address: i as u32,
                    local_base: 0,
                    param_base: 0,
                    param_count: 0,
                    function_name: format!("f{}", i),
                })
                .unwrap();
        }
        let err = calls
            .push(CallFrame {
                return_address: 0,
                local_base: 0,
                param_base: 0,
                param_count: 0,
                function_name: "overflow".into(),
            })
            .unwrap_err();
        assert_eq!(err.kind, VmErrorKind::CallStackOverflow);
    }
}
