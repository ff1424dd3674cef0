use crate::instruction::Instruction;
use crate::ty::{FunctionType, Type};
use crate::value::{BlockId, ValueId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    /// `sret(<ty>)`: the parameter points at the caller-provided return slot.
    StructRet(Type),
    ByVal(Type),
    NoUnwind,
    NoReturn,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub id: ValueId,
    pub name: Option<String>,
    pub ty: Type,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub name: Option<String>,
    pub instructions: Vec<Instruction>,
}

impl Block {
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|inst| inst.is_terminator())
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator()
            .map(Instruction::successors)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Mangled symbol name.
    pub name: String,
    pub demangled_name: Option<String>,
    pub ty: FunctionType,
    pub params: Vec<Param>,
    pub attributes: Vec<Attribute>,
    pub return_attributes: Vec<Attribute>,
    pub personality: Option<String>,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_variadic(&self) -> bool {
        self.ty.variadic
    }

    pub fn is_void_return(&self) -> bool {
        self.ty.ret.is_void()
    }

    pub fn is_nounwind(&self) -> bool {
        self.attributes
            .iter()
            .any(|attr| matches!(attr, Attribute::NoUnwind))
    }

    /// The aggregate returned through the first parameter, if this function uses
    /// the return-by-pointer convention.
    pub fn struct_return_type(&self) -> Option<&Type> {
        if !self.is_void_return() {
            return None;
        }
        let first = self.params.first()?;
        if !first.ty.is_pointer() {
            return None;
        }
        first.attributes.iter().find_map(|attr| match attr {
            Attribute::StructRet(ty) => Some(ty),
            _ => None,
        })
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.iter().find(|block| block.id == id)
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|block| block.instructions.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<Type>,
    pub packed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    pub initializer: Option<Vec<u8>>,
    pub constant: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub structs: Vec<StructType>,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn struct_type(&self, name: &str) -> Option<&StructType> {
        self.structs.iter().find(|ty| ty.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|func| func.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|global| global.name == name)
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
