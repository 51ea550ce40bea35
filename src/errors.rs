// File: src/errors.rs
//
// Error handling and reporting for the ST virtual machine.
// Provides structured error types with source location information
// and pretty-printed error messages.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0 }
    }

    pub fn is_known(&self) -> bool {
        self.line != 0
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Categories of fatal errors; none of them are recoverable inside the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    LoadError,
    ValidationError,
    RuntimeError,
    TypeError,
    DivisionByZero,
    StackOverflow,
    StackUnderflow,
    CallStackOverflow,
    IndexOutOfRange,
    UndefinedVariable,
    ConversionError,
    Timeout,
    SyncError,
}

impl fmt::Display for VmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmErrorKind::LoadError => write!(f, "Load Error"),
            VmErrorKind::ValidationError => write!(f, "Validation Error"),
            VmErrorKind::RuntimeError => write!(f, "Runtime Error"),
            VmErrorKind::TypeError => write!(f, "Type Error"),
            VmErrorKind::DivisionByZero => write!(f, "Division By Zero"),
            VmErrorKind::StackOverflow => write!(f, "Stack Overflow"),
            VmErrorKind::StackUnderflow => write!(f, "Stack Underflow"),
            VmErrorKind::CallStackOverflow => write!(f, "Call Stack Overflow"),
            VmErrorKind::IndexOutOfRange => write!(f, "Index Out Of Range"),
            VmErrorKind::UndefinedVariable => write!(f, "Undefined Variable"),
            VmErrorKind::ConversionError => write!(f, "Conversion Error"),
            VmErrorKind::Timeout => write!(f, "Timeout"),
            VmErrorKind::SyncError => write!(f, "Sync Error"),
        }
    }
}

/// A structured error with location information
#[derive(Debug, Clone)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub message: String,
    pub location: SourceLocation,
}

impl VmError {
    pub fn new(kind: VmErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), location: SourceLocation::unknown() }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = location;
        self
    }

    pub fn load(message: impl Into<String>) -> Self {
        Self::new(VmErrorKind::LoadError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(VmErrorKind::ValidationError, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(VmErrorKind::RuntimeError, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(VmErrorKind::TypeError, message)
    }

    pub fn sync(message: impl Into<String>) -> Self {
        Self::new(VmErrorKind::SyncError, message)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind_str = format!("{}", self.kind);
        write!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;

        if self.location.is_known() {
            let location_str = format!("  --> line {}", self.location);
            write!(f, "\n{}", location_str.bright_blue())?;
        }

        Ok(())
    }
}

impl std::error::Error for VmError {}
