//! Stack-based, object-typed bytecode produced by the translator.
//!
//! A [`TargetModule`] holds nominal records, statics and methods. Method bodies are a
//! flat op list with symbolic labels, typed local slots and lexically nested exception
//! regions.

pub mod builder;
mod format;
pub mod layout;
mod runtime;
mod validate;

pub use builder::MethodBodyBuilder;
pub use format::format_module;
pub use runtime::RuntimeEntry;
pub use validate::{label_positions, validate_method, validate_module};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BYTECODE_MAGIC: [u8; 4] = *b"IBBC";
pub const BYTECODE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntWidth {
    I8,
    I16,
    I32,
    I64,
    I128,
}

impl IntWidth {
    /// Smallest width holding `bits`; `None` above 128.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0..=8 => Some(IntWidth::I8),
            9..=16 => Some(IntWidth::I16),
            17..=32 => Some(IntWidth::I32),
            33..=64 => Some(IntWidth::I64),
            65..=128 => Some(IntWidth::I128),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            IntWidth::I8 => 8,
            IntWidth::I16 => 16,
            IntWidth::I32 => 32,
            IntWidth::I64 => 64,
            IntWidth::I128 => 128,
        }
    }

    /// Wraps `value` to this width, sign-extended back to `i128`.
    pub fn normalize(self, value: i128) -> i128 {
        let shift = 128 - self.bits();
        (value << shift) >> shift
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FloatKind {
    Half,
    Single,
    Double,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSig {
    Void,
    Bool,
    Int(IntWidth),
    Half,
    Single,
    Double,
    /// `Pointer(Void)` is the untyped object pointer.
    Pointer(Box<TypeSig>),
    Array(Box<TypeSig>, u64),
    Record(RecordId),
    /// Packed trailing arguments of a variadic method.
    VarArgs,
}

impl TypeSig {
    pub fn opaque_pointer() -> Self {
        TypeSig::Pointer(Box::new(TypeSig::Void))
    }

    pub fn pointer_to(pointee: TypeSig) -> Self {
        TypeSig::Pointer(Box::new(pointee))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeSig::Void)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, TypeSig::Pointer(_))
    }

    /// Numeric class used by arithmetic, compare and convert ops.
    pub fn num_kind(&self) -> Option<NumKind> {
        match self {
            TypeSig::Bool => Some(NumKind::Bool),
            TypeSig::Int(width) => Some(NumKind::Int(*width)),
            TypeSig::Half => Some(NumKind::Float(FloatKind::Half)),
            TypeSig::Single => Some(NumKind::Float(FloatKind::Single)),
            TypeSig::Double => Some(NumKind::Float(FloatKind::Double)),
            TypeSig::Pointer(_) => Some(NumKind::Pointer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumKind {
    Bool,
    Int(IntWidth),
    Float(FloatKind),
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeSig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDef {
    pub name: String,
    pub mangled_name: String,
    pub fields: Vec<FieldDef>,
    pub packed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDef {
    pub name: String,
    pub ty: TypeSig,
    pub init: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSig {
    pub params: Vec<TypeSig>,
    pub ret: TypeSig,
    pub variadic: bool,
}

impl MethodSig {
    /// Argument slots including the trailing `VarArgs` slot of variadic methods.
    pub fn arg_slots(&self) -> usize {
        self.params.len() + usize::from(self.variadic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub mangled_name: String,
    pub visibility: Visibility,
    pub signature: MethodSig,
    pub parameter_names: Vec<String>,
    pub body: MethodBody,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MethodBody {
    pub locals: Vec<TypeSig>,
    pub ops: Vec<Op>,
    pub regions: Vec<ExceptionRegion>,
    pub label_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    /// Catches every exception; the handler starts with the exception on the stack.
    Catch,
}

/// Protected range `[try_start, try_end)` and handler range `[handler_start, handler_end)`,
/// both expressed as label positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRegion {
    pub try_start: LabelId,
    pub try_end: LabelId,
    pub handler_start: LabelId,
    pub handler_end: LabelId,
    pub kind: RegionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Bool(bool),
    Int { width: IntWidth, value: i128 },
    Float { kind: FloatKind, value: f64 },
    Null,
    /// Default value of any type: zero scalars, null pointers, zeroed records.
    Default(TypeSig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    LogicalNot,
}

/// `GtUn`/`LtUn` compare integers as unsigned and floats as unordered-or-relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Gt,
    GtUn,
    Lt,
    LtUn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Label(LabelId),
    Nop,
    LoadConst(u32),
    LoadArg(u32),
    LoadLocal(u32),
    StoreLocal(u32),
    LoadLocalAddress(u32),
    /// Resets a local to the default value of its type.
    InitLocal(u32),
    LoadStaticAddress(u32),
    LoadMethodPointer(u32),
    /// `[address] -> [value]`
    LoadIndirect(TypeSig),
    /// `[address, value] -> []`
    StoreIndirect(TypeSig),
    /// `[address] -> [field address]`
    FieldAddress { record: RecordId, field: u32 },
    /// `[address, index] -> [element address]`, stride is the element type.
    ElementAddress(TypeSig),
    Binary { op: BinaryOp, kind: NumKind },
    Unary { op: UnaryOp, kind: NumKind },
    Compare { op: CompareOp, kind: NumKind },
    Convert { from: NumKind, to: NumKind, signed: bool },
    Call { method: u32, arg_count: u32 },
    /// `[args.., method pointer] -> [result?]`
    CallIndirect { arg_count: u32, returns: bool },
    CallRuntime { entry: RuntimeEntry, arg_count: u32 },
    PackVarArgs(u32),
    /// `[va-list address] -> [value]`, advances the cursor stored at the address.
    NextVarArg(TypeSig),
    Dup,
    Pop,
    Branch(LabelId),
    BranchTrue(LabelId),
    BranchFalse(LabelId),
    SwitchValue { cases: Vec<(i128, LabelId)>, default: LabelId },
    /// Exits protected and handler ranges, clearing the evaluation stack.
    Leave(LabelId),
    Return,
    Throw,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetModule {
    pub name: String,
    pub const_pool: Vec<Const>,
    pub records: Vec<RecordDef>,
    pub statics: Vec<StaticDef>,
    pub methods: Vec<MethodDef>,
}

impl TargetModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn record(&self, id: RecordId) -> Option<&RecordDef> {
        self.records.get(id.0 as usize)
    }

    pub fn method_index(&self, name: &str) -> Option<u32> {
        self.methods
            .iter()
            .position(|method| method.name == name)
            .map(|index| index as u32)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|method| method.name == name)
    }

    /// Interns a constant, reusing an equal entry when present.
    pub fn push_const(&mut self, value: Const) -> u32 {
        if let Some(index) = self.const_pool.iter().position(|c| *c == value) {
            return index as u32;
        }
        self.const_pool.push(value);
        (self.const_pool.len() - 1) as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BytecodeFile {
    pub version: u32,
    pub module: TargetModule,
}

#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("bytecode format error: {message}")]
    Format { message: String },
    #[error("bytecode encode failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("bytecode decode failed: {0}")]
    Decode(bincode::Error),
    #[error("invalid method {method}: {message}")]
    Invalid { method: String, message: String },
}

pub type Result<T> = std::result::Result<T, BytecodeError>;

pub fn encode_module(module: &TargetModule) -> Result<Vec<u8>> {
    let file = BytecodeFile {
        version: BYTECODE_VERSION,
        module: module.clone(),
    };
    let mut encoded = Vec::new();
    encoded.extend_from_slice(&BYTECODE_MAGIC);
    encoded.extend_from_slice(&BYTECODE_VERSION.to_le_bytes());
    encoded.extend_from_slice(&bincode::serialize(&file)?);
    Ok(encoded)
}

pub fn decode_module(bytes: &[u8]) -> Result<TargetModule> {
    if bytes.len() < 8 {
        return Err(BytecodeError::Format {
            message: "bytecode header too short".to_string(),
        });
    }
    if bytes[..4] != BYTECODE_MAGIC {
        return Err(BytecodeError::Format {
            message: "invalid bytecode magic".to_string(),
        });
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != BYTECODE_VERSION {
        return Err(BytecodeError::Format {
            message: format!(
                "unsupported bytecode version {}, expected {}",
                version, BYTECODE_VERSION
            ),
        });
    }
    let file: BytecodeFile = bincode::deserialize(&bytes[8..]).map_err(BytecodeError::Decode)?;
    if file.version != BYTECODE_VERSION {
        return Err(BytecodeError::Format {
            message: format!(
                "bytecode payload version {} does not match expected {}",
                file.version, BYTECODE_VERSION
            ),
        });
    }
    validate_module(&file.module)?;
    Ok(file.module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer_module() -> TargetModule {
        let mut module = TargetModule::new("answer");
        let forty_two = module.push_const(Const::Int {
            width: IntWidth::I32,
            value: 42,
        });
        let mut body = MethodBodyBuilder::new();
        body.emit(Op::LoadConst(forty_two));
        body.emit(Op::Return);
        module.methods.push(MethodDef {
            name: "answer".to_string(),
            mangled_name: "answer".to_string(),
            visibility: Visibility::Public,
            signature: MethodSig {
                params: vec![],
                ret: TypeSig::Int(IntWidth::I32),
                variadic: false,
            },
            parameter_names: vec![],
            body: body.finish().expect("labels resolved"),
        });
        module
    }

    #[test]
    fn encoded_module_survives_decode() {
        let module = answer_module();
        let bytes = encode_module(&module).expect("encode");
        assert_eq!(&bytes[..4], b"IBBC");
        let decoded = decode_module(&bytes).expect("decode");
        assert_eq!(decoded, module);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = encode_module(&answer_module()).expect("encode");
        bytes[0] = b'X';
        let err = decode_module(&bytes).unwrap_err();
        assert!(matches!(err, BytecodeError::Format { .. }));
    }

    #[test]
    fn const_pool_interns_equal_values() {
        let mut module = TargetModule::new("pool");
        let a = module.push_const(Const::Bool(true));
        let b = module.push_const(Const::Null);
        let c = module.push_const(Const::Bool(true));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(module.const_pool.len(), 2);
    }

    #[test]
    fn int_width_rounds_up() {
        assert_eq!(IntWidth::from_bits(1), Some(IntWidth::I8));
        assert_eq!(IntWidth::from_bits(24), Some(IntWidth::I32));
        assert_eq!(IntWidth::from_bits(128), Some(IntWidth::I128));
        assert_eq!(IntWidth::from_bits(256), None);
    }
}
