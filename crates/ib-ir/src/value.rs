use crate::instruction::InstrInfo;
use crate::opcode::Opcode;
use crate::ty::Type;
use serde::{Deserialize, Serialize};

/// Identity of an instruction result or a function parameter. Unique within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Identity of a basic block. Unique within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int { ty: Type, value: i64 },
    Float { ty: Type, value: f64 },
    Null,
    Undef(Type),
    Poison(Type),
    Zero(Type),
    NoneToken,
}

impl Constant {
    pub fn ty(&self) -> Type {
        match self {
            Constant::Int { ty, .. } | Constant::Float { ty, .. } => ty.clone(),
            Constant::Null => Type::Pointer,
            Constant::Undef(ty) | Constant::Poison(ty) | Constant::Zero(ty) => ty.clone(),
            Constant::NoneToken => Type::Token,
        }
    }
}

/// An unnamed constant sub-expression folded into an operand list,
/// e.g. `getelementptr (ptr @table, i64 0, i64 2)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstExpr {
    pub opcode: Opcode,
    pub ty: Type,
    pub operands: Vec<Operand>,
    pub info: InstrInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    Const(Constant),
    Expr(Box<ConstExpr>),
    Block(BlockId),
    Global(String),
    Function(String),
}

impl Operand {
    pub fn int(bits: u32, value: i64) -> Self {
        Operand::Const(Constant::Int {
            ty: Type::Int(bits),
            value,
        })
    }

    pub fn bool(value: bool) -> Self {
        Operand::int(1, i64::from(value))
    }

    pub fn f64(value: f64) -> Self {
        Operand::Const(Constant::Float {
            ty: Type::Double,
            value,
        })
    }

    pub fn f32(value: f32) -> Self {
        Operand::Const(Constant::Float {
            ty: Type::Float,
            value: value as f64,
        })
    }

    pub fn null() -> Self {
        Operand::Const(Constant::Null)
    }

    pub fn global(name: impl Into<String>) -> Self {
        Operand::Global(name.into())
    }

    pub fn function(name: impl Into<String>) -> Self {
        Operand::Function(name.into())
    }

    pub fn expr(opcode: Opcode, ty: Type, operands: Vec<Operand>, info: InstrInfo) -> Self {
        Operand::Expr(Box::new(ConstExpr {
            opcode,
            ty,
            operands,
            info,
        }))
    }

    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<BlockId> {
        match self {
            Operand::Block(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Operand::Const(Constant::Int { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Operand::Block(_))
    }
}
