use serde::{Deserialize, Serialize};

/// A source IR type.
///
/// Pointers are opaque: the pointee is never recorded on the pointer itself, it is
/// recovered from the instruction that needs it (alloca, load, GEP).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    Int(u32),
    Half,
    Float,
    Double,
    Pointer,
    Array(Box<Type>, u64),
    Vector(Box<Type>, u32),
    /// Named aggregate; the body lives in [`crate::Module::structs`].
    Struct(String),
    /// Unnamed aggregate such as `{ i32, ptr }`.
    Literal {
        fields: Vec<Type>,
        packed: bool,
    },
    Function(FunctionType),
    Label,
    Token,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionType {
    pub ret: Box<Type>,
    pub params: Vec<Type>,
    pub variadic: bool,
}

impl FunctionType {
    pub fn new(ret: Type, params: Vec<Type>) -> Self {
        Self {
            ret: Box::new(ret),
            params,
            variadic: false,
        }
    }

    pub fn variadic(ret: Type, params: Vec<Type>) -> Self {
        Self {
            ret: Box::new(ret),
            params,
            variadic: true,
        }
    }
}

impl Type {
    pub fn i1() -> Self {
        Type::Int(1)
    }

    pub fn i8() -> Self {
        Type::Int(8)
    }

    pub fn i32() -> Self {
        Type::Int(32)
    }

    pub fn i64() -> Self {
        Type::Int(64)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Type::Struct(name.into())
    }

    pub fn array(element: Type, len: u64) -> Self {
        Type::Array(Box::new(element), len)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Half | Type::Float | Type::Double)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer)
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Struct(_) | Type::Literal { .. } | Type::Array(..))
    }

    pub fn int_bits(&self) -> Option<u32> {
        match self {
            Type::Int(bits) => Some(*bits),
            _ => None,
        }
    }
}
