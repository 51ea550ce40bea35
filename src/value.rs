// File: src/value.rs
//
// Runtime values for the ST virtual machine.
// Every value carries its type tag; instruction handlers dispatch on the
// tag before acting. Strings are owned copies, never shared with the
// constant pool.

use num_enum::TryFromPrimitive;
use std::fmt;

/// Type tags for runtime values; also the on-wire discriminants used by
/// variable-sync and checkpoint payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum ValueTag {
    Bool = 0,
    Int = 1,
    DInt = 2,
    Real = 3,
    String = 4,
    Time = 5,
    Undefined = 6,
}

/// A tagged runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    /// 32-bit signed integer (ST `INT`/`DINT` map to Int/DInt)
    Int(i32),
    /// 64-bit signed integer
    DInt(i64),
    /// 64-bit IEEE-754 real
    Real(f64),
    /// Owned UTF-8 string
    String(String),
    /// Unsigned milliseconds
    Time(u64),
    /// Uninitialized slot marker; never appears on the operand stack
    Undefined,
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Bool(_) => ValueTag::Bool,
            Value::Int(_) => ValueTag::Int,
            Value::DInt(_) => ValueTag::DInt,
            Value::Real(_) => ValueTag::Real,
            Value::String(_) => ValueTag::String,
            Value::Time(_) => ValueTag::Time,
            Value::Undefined => ValueTag::Undefined,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "BOOL",
            Value::Int(_) => "INT",
            Value::DInt(_) => "DINT",
            Value::Real(_) => "REAL",
            Value::String(_) => "STRING",
            Value::Time(_) => "TIME",
            Value::Undefined => "UNDEFINED",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::DInt(_) | Value::Real(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Zero value for a declared type tag, used to initialize memory slots
    pub fn zero_of(tag: ValueTag) -> Value {
        match tag {
            ValueTag::Bool => Value::Bool(false),
            ValueTag::Int => Value::Int(0),
            ValueTag::DInt => Value::DInt(0),
            ValueTag::Real => Value::Real(0.0),
            ValueTag::String => Value::String(String::new()),
            ValueTag::Time => Value::Time(0),
            ValueTag::Undefined => Value::Undefined,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::DInt(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::String(s) => write!(f, "{}", s),
            Value::Time(ms) => write!(f, "T#{}ms", ms),
            Value::Undefined => write!(f, "<undefined>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_wire_discriminants() {
        assert_eq!(Value::Bool(true).tag() as u32, 0);
        assert_eq!(Value::Int(1).tag() as u32, 1);
        assert_eq!(Value::DInt(1).tag() as u32, 2);
        assert_eq!(Value::Real(1.0).tag() as u32, 3);
        assert_eq!(Value::String("x".into()).tag() as u32, 4);
        assert_eq!(Value::Time(1).tag() as u32, 5);
        assert_eq!(Value::Undefined.tag() as u32, 6);
    }

    #[test]
    fn zero_values_match_declared_types() {
        assert_eq!(Value::zero_of(ValueTag::Int), Value::Int(0));
        assert_eq!(Value::zero_of(ValueTag::Bool), Value::Bool(false));
        assert_eq!(Value::zero_of(ValueTag::String), Value::String(String::new()));
        assert!(Value::zero_of(ValueTag::Undefined).is_undefined());
    }

    #[test]
    fn display_uses_st_literals() {
        assert_eq!(Value::Bool(true).to_string(), "TRUE");
        assert_eq!(Value::Time(1500).to_string(), "T#1500ms");
    }
}
