//! IR value types.
//!
//! The real data types come from the front end: booleans, sized and unsized
//! integers, strings and function signatures. Two synthetic types exist only
//! inside the IR: [`Type::MemoryState`], which sequences side effects, and
//! [`Type::Result`], which pairs an optional returned value with the final
//! memory state of a control-flow path. Neither has a runtime representation.

use std::fmt;

/// The basic (non-composite) types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BasicKind {
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Byte,
    Uint16,
    Uint32,
    Uint64,
    Uintptr,
    String,
    UntypedBool,
    UntypedInt,
    UntypedString,
}

impl BasicKind {
    pub const ALL: [BasicKind; 17] = [
        BasicKind::Bool,
        BasicKind::Int,
        BasicKind::Int8,
        BasicKind::Int16,
        BasicKind::Int32,
        BasicKind::Int64,
        BasicKind::Uint,
        BasicKind::Uint8,
        BasicKind::Byte,
        BasicKind::Uint16,
        BasicKind::Uint32,
        BasicKind::Uint64,
        BasicKind::Uintptr,
        BasicKind::String,
        BasicKind::UntypedBool,
        BasicKind::UntypedInt,
        BasicKind::UntypedString,
    ];

    pub const fn name(self) -> &'static str {
        use BasicKind::*;
        match self {
            Bool => "bool",
            Int => "int",
            Int8 => "int8",
            Int16 => "int16",
            Int32 => "int32",
            Int64 => "int64",
            Uint => "uint",
            Uint8 => "uint8",
            Byte => "byte",
            Uint16 => "uint16",
            Uint32 => "uint32",
            Uint64 => "uint64",
            Uintptr => "uintptr",
            String => "string",
            UntypedBool => "untyped bool",
            UntypedInt => "untyped int",
            UntypedString => "untyped string",
        }
    }

    pub const fn is_boolean(self) -> bool {
        matches!(self, BasicKind::Bool | BasicKind::UntypedBool)
    }

    pub const fn is_integer(self) -> bool {
        use BasicKind::*;
        matches!(
            self,
            Int | Int8 | Int16 | Int32 | Int64 | Uint | Uint8 | Byte | Uint16 | Uint32 | Uint64 | Uintptr | UntypedInt
        )
    }

    pub const fn is_string(self) -> bool {
        matches!(self, BasicKind::String | BasicKind::UntypedString)
    }
}

/// A named function parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    pub params: Vec<Param>,
    pub result: Option<Box<Type>>,
}

impl Signature {
    pub fn new(params: Vec<Param>, result: Option<Type>) -> Self {
        Self {
            params,
            result: result.map(Box::new),
        }
    }

    /// A signature with no parameters and no result.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.result.is_none()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(func (")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "({} {})", param.name, param.ty)?;
        }
        f.write_str(")")?;
        if let Some(result) = &self.result {
            write!(f, " {}", result)?;
        }
        f.write_str(")")
    }
}

/// The type of an IR value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Basic(BasicKind),
    Signature(Signature),
    MemoryState,
    /// An optional returned value plus the final memory state.
    Result(Option<Box<Type>>),
}

impl Type {
    pub const BOOL: Type = Type::Basic(BasicKind::Bool);
    pub const INT64: Type = Type::Basic(BasicKind::Int64);
    pub const STRING: Type = Type::Basic(BasicKind::String);

    /// A Result carrying no value.
    pub const fn void_result() -> Type {
        Type::Result(None)
    }

    /// A Result carrying a value of type `ty`.
    pub fn result_of(ty: Type) -> Type {
        Type::Result(Some(Box::new(ty)))
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, Type::Basic(kind) if kind.is_boolean())
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Basic(kind) if kind.is_integer())
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Type::Basic(kind) if kind.is_string())
    }

    pub fn is_memory_state(&self) -> bool {
        matches!(self, Type::MemoryState)
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Type::Result(_))
    }

    /// Whether values of this type exist at runtime.
    pub fn is_synthetic(&self) -> bool {
        self.is_memory_state() || self.is_result()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Basic(kind) => f.write_str(kind.name()),
            Type::Signature(sig) => sig.fmt(f),
            Type::MemoryState => f.write_str("memory state"),
            Type::Result(None) => f.write_str("result"),
            Type::Result(Some(ty)) => write!(f, "result({})", ty),
        }
    }
}
