use ib_bytecode::BytecodeError;
use ib_ir::{BlockId, Opcode, ValueId};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Where a structural defect was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub function: String,
    pub instruction: Option<ValueId>,
    pub opcode: Option<Opcode>,
}

impl Location {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            function: name.into(),
            instruction: None,
            opcode: None,
        }
    }

    pub fn at(&self, instruction: Option<ValueId>, opcode: Opcode) -> Self {
        Self {
            function: self.function.clone(),
            instruction,
            opcode: Some(opcode),
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "in function {}", self.function)?;
        if let Some(opcode) = self.opcode {
            match self.instruction {
                Some(id) => write!(f, " at {} ({})", id, opcode)?,
                None => write!(f, " at synthesized {}", opcode)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralDefect {
    #[error("expected {expected} operands, found {found}")]
    Arity { expected: String, found: usize },
    #[error("unknown comparison predicate {0}")]
    UnknownPredicate(u32),
    #[error("field index into {aggregate} is not a constant integer")]
    NonConstantFieldIndex { aggregate: String },
    #[error("field index {index} out of range for {aggregate} with {fields} fields")]
    FieldIndexOutOfRange {
        aggregate: String,
        index: i64,
        fields: usize,
    },
    #[error("cannot index through non-aggregate type {ty}")]
    IndexThroughLeaf { ty: String },
    #[error("reference to unknown block {0}")]
    MissingBlock(BlockId),
    #[error("exception handling without a personality function")]
    MissingPersonality,
    #[error("unknown personality function {0}")]
    UnknownPersonality(String),
    #[error("constant expression exceeds {0} nodes")]
    ConstantExpressionLimit(usize),
    #[error("return without a value from a non-void function")]
    ReturnWithoutValue,
    #[error("phi has no incoming value for predecessor {0}")]
    PhiMismatch(BlockId),
    #[error("type {0} was not registered before lowering")]
    UnregisteredType(String),
    #[error("invalid operand: {0}")]
    InvalidOperand(String),
    #[error("opcode {0} produces a value but has no lowering")]
    UnsupportedOpcode(Opcode),
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{location}: {defect}")]
    Structural {
        location: Location,
        defect: StructuralDefect,
    },
    #[error("{location}: unresolved symbol {symbol}")]
    UnresolvedSymbol { location: Location, symbol: String },
    #[error("unsupported type {ty}")]
    UnsupportedType { ty: String },
    #[error("failed to parse module: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
}

impl TranslateError {
    pub fn structural(location: &Location, defect: StructuralDefect) -> Self {
        TranslateError::Structural {
            location: location.clone(),
            defect,
        }
    }

    pub fn defect(&self) -> Option<&StructuralDefect> {
        match self {
            TranslateError::Structural { defect, .. } => Some(defect),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TranslateError>;

/// Return early with a structural defect at a location.
#[macro_export]
macro_rules! defect {
    ($location:expr, $defect:expr) => {
        return Err($crate::error::TranslateError::structural(&$location, $defect))
    };
}

/// Ensure an operand count, or return an arity defect.
#[macro_export]
macro_rules! ensure_arity {
    ($location:expr, $operands:expr, $expected:expr) => {
        if $operands.len() != $expected {
            $crate::defect!(
                $location,
                $crate::error::StructuralDefect::Arity {
                    expected: $expected.to_string(),
                    found: $operands.len(),
                }
            );
        }
    };
}
