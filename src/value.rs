// File: src/value.rs
//
// Runtime value types for Smalt.
// The value universe is a tagged union; classes are first-class data, not
// host-language types. Compound values share state through Arc, so value
// identity is pointer identity for everything except strings.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::bytecode::{BytecodeUnit, MethodSpec};

/// Dictionary storage. Keys are restricted to the hashable primitive kinds.
pub type DictMap = AHashMap<DictKey, Value>;

/// Runtime values in the Smalt VM.
#[derive(Clone)]
pub enum Value {
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point number
    Float(f64),
    /// Boolean value
    Bool(bool),
    /// The nil value
    Nil,
    /// Immutable string (reference-counted for cheap cloning)
    Str(Arc<String>),
    /// Mutable ordered sequence; 1-based at the language surface
    Array(Arc<Mutex<Vec<Value>>>),
    /// Mutable keyed map with primitive keys
    Dictionary(Arc<Mutex<DictMap>>),
    /// A class descriptor as a first-class value
    Class(Arc<RuntimeClass>),
    /// An object: class descriptor plus a flat field array sized for the
    /// whole inheritance chain
    Instance(Arc<Mutex<Instance>>),
    /// A block closure
    Block(Arc<BlockValue>),
}

/// A defined class at run time. Built by DefineClass from a ClassSpec, with
/// the superclass resolved against the registry and the field offset
/// computed from the chain.
pub struct RuntimeClass {
    pub name: String,
    pub superclass: Option<Arc<RuntimeClass>>,
    /// Fields declared by this class only.
    pub instance_fields: Vec<String>,
    /// Number of fields contributed by superclasses; this class's own
    /// fields occupy absolute indices `field_offset ..`.
    pub field_offset: usize,
    /// Total field count across the chain; every instance's field array
    /// has exactly this length.
    pub total_fields: usize,
    pub class_variables: Vec<String>,
    /// Slot-indexed values shared by all instances, parallel to
    /// `class_variables`.
    pub class_var_values: Mutex<Vec<Value>>,
    pub instance_methods: Vec<Arc<MethodSpec>>,
    /// Class-side methods. Not inherited.
    pub class_methods: Vec<Arc<MethodSpec>>,
}

impl RuntimeClass {
    /// Find a class-side method. Class methods are looked up on the
    /// receiving class only.
    pub fn lookup_class_method(&self, selector: &str) -> Option<Arc<MethodSpec>> {
        self.class_methods.iter().find(|m| m.selector == selector).cloned()
    }
}

/// Walk the class chain for an instance method. Returns the method and the
/// class that defines it (the starting class for a later super send).
pub fn lookup_instance_method(
    class: &Arc<RuntimeClass>,
    selector: &str,
) -> Option<(Arc<RuntimeClass>, Arc<MethodSpec>)> {
    let mut current = Some(class.clone());
    while let Some(cls) = current {
        if let Some(method) = cls.instance_methods.iter().find(|m| m.selector == selector) {
            return Some((cls.clone(), method.clone()));
        }
        current = cls.superclass.clone();
    }
    None
}

pub struct Instance {
    pub class: Arc<RuntimeClass>,
    pub fields: Vec<Value>,
}

/// A block closure. Blocks do not own a frame: they read and write the
/// locals array of the activation that created them, with their parameters
/// occupying slots `parent_local_count ..`.
pub struct BlockValue {
    pub unit: Arc<BytecodeUnit>,
    pub param_count: usize,
    pub parent_local_count: usize,
    /// The creating activation's locals, shared.
    pub frame: Arc<Mutex<Vec<Value>>>,
    /// `self` inside the block, inherited from the creating activation.
    pub receiver: Value,
    /// Defining class for super sends inside the block.
    pub defining_class: Option<Arc<RuntimeClass>>,
    /// The method activation a non-local return unwinds to. Inherited
    /// transitively when a block is created inside another block.
    pub home: Arc<HomeContext>,
}

/// Identity token for a method (or top-level) activation. Non-local
/// returns target these by pointer identity, never by name.
pub struct HomeContext {
    pub name: String,
}

/// Dictionary key: the equality-comparable primitive kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Int(i64),
    /// Stored as raw bits so the key is hashable.
    Float(u64),
    Bool(bool),
    Nil,
    Str(String),
}

impl DictKey {
    /// None for the non-hashable kinds (collections, instances, blocks,
    /// classes), which the VM reports as a runtime error.
    pub fn from_value(value: &Value) -> Option<DictKey> {
        match value {
            Value::Int(n) => Some(DictKey::Int(*n)),
            Value::Float(f) => Some(DictKey::Float(f.to_bits())),
            Value::Bool(b) => Some(DictKey::Bool(*b)),
            Value::Nil => Some(DictKey::Nil),
            Value::Str(s) => Some(DictKey::Str(s.as_ref().clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DictKey::Int(n) => Value::Int(*n),
            DictKey::Float(bits) => Value::Float(f64::from_bits(*bits)),
            DictKey::Bool(b) => Value::Bool(*b),
            DictKey::Nil => Value::Nil,
            DictKey::Str(s) => Value::str_ref(s),
        }
    }
}

impl Value {
    /// Helper to create a Str value from a String
    pub fn str(s: String) -> Self {
        Value::Str(Arc::new(s))
    }

    /// Helper to create a Str value from a &str
    pub fn str_ref(s: &str) -> Self {
        Value::Str(Arc::new(s.to_string()))
    }

    /// Helper to create an Array value from a Vec<Value>
    pub fn array(vec: Vec<Value>) -> Self {
        Value::Array(Arc::new(Mutex::new(vec)))
    }

    /// Helper to create a Dictionary value from a DictMap
    pub fn dictionary(map: DictMap) -> Self {
        Value::Dictionary(Arc::new(Mutex::new(map)))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Boolean",
            Value::Nil => "Nil",
            Value::Str(_) => "String",
            Value::Array(_) => "Array",
            Value::Dictionary(_) => "Dictionary",
            Value::Class(_) => "Class",
            Value::Instance(_) => "Instance",
            Value::Block(_) => "Block",
        }
    }

    /// Language-surface equality (`=`): value equality for scalars,
    /// character-wise for strings, pointer identity for everything else.
    /// Values of different kinds are never equal.
    pub fn st_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Str(a), Value::Str(b)) => a.as_ref() == b.as_ref(),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Dictionary(a), Value::Dictionary(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Block(a), Value::Block(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Printable rendering used by `print`, `println` and `asString`.
    pub fn display_string(&self) -> String {
        self.display_with_depth(0)
    }

    fn display_with_depth(&self, depth: usize) -> String {
        // Collections can be cyclic; stop descending instead of looping.
        if depth > 4 {
            return "...".to_string();
        }

        match self {
            Value::Int(n) => n.to_string(),
            Value::Float(f) => {
                let s = f.to_string();
                if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
                    s
                } else {
                    format!("{}.0", s)
                }
            }
            Value::Bool(b) => b.to_string(),
            Value::Nil => "nil".to_string(),
            Value::Str(s) => s.as_ref().clone(),
            Value::Array(items) => {
                let items = items.lock().unwrap();
                let parts: Vec<String> =
                    items.iter().map(|v| v.display_with_depth(depth + 1)).collect();
                format!("#({})", parts.join(" "))
            }
            Value::Dictionary(map) => {
                let map = map.lock().unwrap();
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{} -> {}",
                            k.to_value().display_with_depth(depth + 1),
                            v.display_with_depth(depth + 1)
                        )
                    })
                    .collect();
                format!("#{{{}}}", parts.join(". "))
            }
            Value::Class(class) => class.name.clone(),
            Value::Instance(instance) => {
                let name = instance.lock().unwrap().class.name.clone();
                format!("{} {}", article_for(&name), name)
            }
            Value::Block(_) => "a Block".to_string(),
        }
    }
}

fn article_for(name: &str) -> &'static str {
    match name.chars().next() {
        Some('A') | Some('E') | Some('I') | Some('O') | Some('U') => "an",
        _ => "a",
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Nil => write!(f, "Nil"),
            Value::Str(s) => write!(f, "Str({:?})", s.as_ref()),
            Value::Array(items) => write!(f, "Array[{}]", items.lock().unwrap().len()),
            Value::Dictionary(map) => write!(f, "Dictionary{{{} keys}}", map.lock().unwrap().len()),
            Value::Class(class) => write!(f, "Class({})", class.name),
            Value::Instance(instance) => {
                write!(f, "Instance({})", instance.lock().unwrap().class.name)
            }
            Value::Block(block) => {
                write!(f, "Block({} params, home {})", block.param_count, block.home.name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_equality_is_character_wise() {
        let a = Value::str_ref("woof");
        let b = Value::str_ref("woof");
        assert!(a.st_equals(&b));
        assert!(!a.st_equals(&Value::str_ref("meow")));
    }

    #[test]
    fn test_array_equality_is_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert!(!a.st_equals(&b));
        assert!(a.st_equals(&a.clone()));
    }

    #[test]
    fn test_cross_kind_equality_is_false() {
        assert!(!Value::Int(1).st_equals(&Value::Float(1.0)));
        assert!(!Value::Nil.st_equals(&Value::Bool(false)));
    }

    #[test]
    fn test_dict_key_rejects_collections() {
        assert!(DictKey::from_value(&Value::array(vec![])).is_none());
        assert!(DictKey::from_value(&Value::Int(3)).is_some());
        assert!(DictKey::from_value(&Value::Nil).is_some());
    }

    #[test]
    fn test_display_rendering() {
        assert_eq!(Value::Int(7).display_string(), "7");
        assert_eq!(Value::Float(3.0).display_string(), "3.0");
        assert_eq!(Value::Nil.display_string(), "nil");
        let arr = Value::array(vec![Value::Int(1), Value::str_ref("x")]);
        assert_eq!(arr.display_string(), "#(1 x)");
    }
}
