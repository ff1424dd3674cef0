//! SSA intermediate representation consumed by the translator.
//!
//! The model is deliberately close to LLVM IR: typed values, basic blocks ending in a
//! terminator, opaque pointers, named struct types and constant expressions nested
//! inside operand lists.

pub mod builder;
pub mod instruction;
pub mod module;
pub mod opcode;
mod pretty;
pub mod ty;
pub mod value;

pub use builder::{FunctionBuilder, ModuleBuilder};
pub use instruction::{InstrInfo, Instruction};
pub use module::{Attribute, Block, Function, Global, Module, Param, StructType};
pub use opcode::{predicate, Opcode};
pub use ty::{FunctionType, Type};
pub use value::{BlockId, ConstExpr, Constant, Operand, ValueId};
