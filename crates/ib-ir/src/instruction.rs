use crate::opcode::Opcode;
use crate::ty::{FunctionType, Type};
use crate::value::{BlockId, Operand, ValueId};
use serde::{Deserialize, Serialize};

/// Opcode-specific facts that are not operands.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum InstrInfo {
    #[default]
    None,
    /// `icmp`/`fcmp` predicate code, see [`crate::opcode::predicate`].
    Predicate(u32),
    Gep {
        source_element: Type,
        inbounds: bool,
    },
    Alloca {
        allocated: Type,
    },
    /// Incoming blocks of a phi, parallel to its operands.
    Phi {
        incoming_blocks: Vec<BlockId>,
    },
    Call {
        function_type: FunctionType,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub name: Option<String>,
    pub opcode: Opcode,
    /// Result type; `Void` for instructions that produce nothing.
    pub ty: Type,
    pub operands: Vec<Operand>,
    pub info: InstrInfo,
}

impl Instruction {
    pub fn new(id: ValueId, opcode: Opcode, ty: Type, operands: Vec<Operand>) -> Self {
        Self {
            id,
            name: None,
            opcode,
            ty,
            operands,
            info: InstrInfo::None,
        }
    }

    pub fn with_info(mut self, info: InstrInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode.is_terminator()
    }

    pub fn is_conditional_branch(&self) -> bool {
        self.opcode == Opcode::Br && self.operands.len() == 3
    }

    /// Source-level successor blocks, in operand order. Only terminators have any.
    pub fn successors(&self) -> Vec<BlockId> {
        if !self.is_terminator() {
            return Vec::new();
        }
        self.operands.iter().filter_map(Operand::as_block).collect()
    }

    pub fn predicate(&self) -> Option<u32> {
        match &self.info {
            InstrInfo::Predicate(code) => Some(*code),
            _ => None,
        }
    }
}
