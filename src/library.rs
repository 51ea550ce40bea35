// File: src/library.rs
//
// Native function bridge for the ST virtual machine.
// Builtin and library functions share one calling convention: the
// dispatcher peels the registered number of arguments off the operand
// stack in push order, invokes the handler, and pushes the result value
// if the function returns one. Names are resolved to table indices at
// bytecode-generation time, never at call time.

use crate::value::Value;

/// Native handler contract. A handler receives the arguments in push
/// order and returns one value, nothing (void), or an error message that
/// becomes a fatal runtime error.
pub type NativeFn = fn(&[Value]) -> Result<Option<Value>, String>;

/// One registered native function
pub struct NativeFunction {
    pub name: &'static str,
    pub arity: u32,
    pub handler: NativeFn,
}

/// Flat, index-keyed registries for builtin and library functions,
/// populated by the host during initialization
pub struct LibraryManager {
    builtins: Vec<NativeFunction>,
    library: Vec<NativeFunction>,
}

impl LibraryManager {
    pub fn new() -> Self {
        Self { builtins: Vec::new(), library: Vec::new() }
    }

    /// Registry preloaded with the core builtins and the time library
    pub fn with_defaults() -> Self {
        let mut mgr = Self::new();
        mgr.register_core_builtins();
        crate::time_lib::register(&mut mgr);
        mgr
    }

    pub fn register_builtin(&mut self, name: &'static str, arity: u32, handler: NativeFn) -> u32 {
        let index = self.builtins.len() as u32;
        self.builtins.push(NativeFunction { name, arity, handler });
        index
    }

    pub fn register_library(&mut self, name: &'static str, arity: u32, handler: NativeFn) -> u32 {
        let index = self.library.len() as u32;
        self.library.push(NativeFunction { name, arity, handler });
        index
    }

    pub fn builtin(&self, index: u32) -> Option<&NativeFunction> {
        self.builtins.get(index as usize)
    }

    pub fn library_fn(&self, index: u32) -> Option<&NativeFunction> {
        self.library.get(index as usize)
    }

    /// Generation-time name resolution
    pub fn builtin_index(&self, name: &str) -> Option<u32> {
        self.builtins.iter().position(|f| f.name == name).map(|i| i as u32)
    }

    pub fn library_index(&self, name: &str) -> Option<u32> {
        self.library.iter().position(|f| f.name == name).map(|i| i as u32)
    }

    pub fn builtin_count(&self) -> usize {
        self.builtins.len()
    }

    pub fn library_count(&self) -> usize {
        self.library.len()
    }

    fn register_core_builtins(&mut self) {
        self.register_builtin("print", 1, builtin_print);
        self.register_builtin("abs", 1, builtin_abs);
        self.register_builtin("min", 2, builtin_min);
        self.register_builtin("max", 2, builtin_max);
        self.register_builtin("sqrt", 1, builtin_sqrt);
        self.register_builtin("len", 1, builtin_len);
    }
}

impl Default for LibraryManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---- core builtins ----

fn builtin_print(args: &[Value]) -> Result<Option<Value>, String> {
    println!("{}", args[0]);
    Ok(None)
}

fn builtin_abs(args: &[Value]) -> Result<Option<Value>, String> {
    match &args[0] {
        Value::Int(i) => Ok(Some(Value::Int(i.wrapping_abs()))),
        Value::DInt(i) => Ok(Some(Value::DInt(i.wrapping_abs()))),
        Value::Real(r) => Ok(Some(Value::Real(r.abs()))),
        other => Err(format!("abs expects a numeric argument, got {}", other.type_name())),
    }
}

fn builtin_min(args: &[Value]) -> Result<Option<Value>, String> {
    numeric_pair(args, "min", |a, b| a.min(b), |a, b| a.min(b))
}

fn builtin_max(args: &[Value]) -> Result<Option<Value>, String> {
    numeric_pair(args, "max", |a, b| a.max(b), |a, b| a.max(b))
}

fn numeric_pair(
    args: &[Value],
    name: &str,
    int_op: fn(i32, i32) -> i32,
    real_op: fn(f64, f64) -> f64,
) -> Result<Option<Value>, String> {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => Ok(Some(Value::Int(int_op(*a, *b)))),
        (Value::Real(a), Value::Real(b)) => Ok(Some(Value::Real(real_op(*a, *b)))),
        (a, b) => Err(format!(
            "{} expects two INT or two REAL arguments, got {} and {}",
            name,
            a.type_name(),
            b.type_name()
        )),
    }
}

fn builtin_sqrt(args: &[Value]) -> Result<Option<Value>, String> {
    match &args[0] {
        Value::Real(r) => Ok(Some(Value::Real(r.sqrt()))),
        Value::Int(i) => Ok(Some(Value::Real((*i as f64).sqrt()))),
        other => Err(format!("sqrt expects a numeric argument, got {}", other.type_name())),
    }
}

fn builtin_len(args: &[Value]) -> Result<Option<Value>, String> {
    match &args[0] {
        Value::String(s) => Ok(Some(Value::Int(s.len() as i32))),
        other => Err(format!("len expects a STRING argument, got {}", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_resolves_names_to_stable_indices() {
        let mgr = LibraryManager::with_defaults();
        assert_eq!(mgr.builtin_index("print"), Some(0));
        assert_eq!(mgr.builtin_index("abs"), Some(1));
        assert_eq!(mgr.builtin_index("missing"), None);
        assert!(mgr.library_index("time_ms").is_some());
    }

    #[test]
    fn abs_handles_each_numeric_type() {
        assert_eq!(builtin_abs(&[Value::Int(-5)]).unwrap(), Some(Value::Int(5)));
        assert_eq!(builtin_abs(&[Value::Real(-2.5)]).unwrap(), Some(Value::Real(2.5)));
        assert!(builtin_abs(&[Value::Bool(true)]).is_err());
    }

    #[test]
    fn min_max_reject_mixed_types() {
        assert_eq!(
            builtin_min(&[Value::Int(3), Value::Int(7)]).unwrap(),
            Some(Value::Int(3))
        );
        assert!(builtin_max(&[Value::Int(3), Value::Real(7.0)]).is_err());
    }

    #[test]
    fn len_counts_bytes() {
        assert_eq!(
            builtin_len(&[Value::String("pump".into())]).unwrap(),
            Some(Value::Int(4))
        );
    }
}
