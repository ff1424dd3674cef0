use crate::emit::Emitter;
use crate::error::{Location, Result, StructuralDefect};
use crate::module::{CallTarget, ModuleContext};
use crate::runtime::RuntimeRoute;
use crate::{defect, ensure_arity};
use ib_bytecode::{
    BinaryOp, CompareOp, Const, NumKind, Op, RecordId, RuntimeEntry, TypeSig, UnaryOp,
};
use ib_ir::{self as ir, predicate, BlockId, Constant, InstrInfo, Opcode, ValueId};
use std::collections::BTreeSet;

/// Index of a node in its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lookup key of a node: its source value, or a counter for nodes synthesized from
/// constant expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Value(ValueId),
    Synthesized(u32),
}

impl ValueKey {
    pub fn value(self) -> Option<ValueId> {
        match self {
            ValueKey::Value(id) => Some(id),
            ValueKey::Synthesized(_) => None,
        }
    }
}

/// An operand as the engine sees it. Value references are resolved lazily through the
/// function's lookup tables.
#[derive(Debug, Clone, PartialEq)]
pub enum OperandRef {
    Value(ValueId),
    Synthesized(u32),
    Const(Constant),
    Block(BlockId),
    Global(String),
    Function(String),
}

impl OperandRef {
    pub fn key(&self) -> Option<ValueKey> {
        match self {
            OperandRef::Value(id) => Some(ValueKey::Value(*id)),
            OperandRef::Synthesized(id) => Some(ValueKey::Synthesized(*id)),
            _ => None,
        }
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            OperandRef::Const(Constant::Int { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<BlockId> {
        match self {
            OperandRef::Block(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl IntPredicate {
    pub fn from_code(code: u32) -> Option<Self> {
        let predicate = match code {
            predicate::ICMP_EQ => IntPredicate::Eq,
            predicate::ICMP_NE => IntPredicate::Ne,
            predicate::ICMP_UGT => IntPredicate::Ugt,
            predicate::ICMP_UGE => IntPredicate::Uge,
            predicate::ICMP_ULT => IntPredicate::Ult,
            predicate::ICMP_ULE => IntPredicate::Ule,
            predicate::ICMP_SGT => IntPredicate::Sgt,
            predicate::ICMP_SGE => IntPredicate::Sge,
            predicate::ICMP_SLT => IntPredicate::Slt,
            predicate::ICMP_SLE => IntPredicate::Sle,
            _ => return None,
        };
        Some(predicate)
    }

    /// Compare op and whether its result is negated.
    fn lowering(self) -> (CompareOp, bool) {
        match self {
            IntPredicate::Eq => (CompareOp::Eq, false),
            IntPredicate::Ne => (CompareOp::Eq, true),
            IntPredicate::Ugt => (CompareOp::GtUn, false),
            IntPredicate::Uge => (CompareOp::LtUn, true),
            IntPredicate::Ult => (CompareOp::LtUn, false),
            IntPredicate::Ule => (CompareOp::GtUn, true),
            IntPredicate::Sgt => (CompareOp::Gt, false),
            IntPredicate::Sge => (CompareOp::Lt, true),
            IntPredicate::Slt => (CompareOp::Lt, false),
            IntPredicate::Sle => (CompareOp::Gt, true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatPredicate {
    False,
    Oeq,
    Ogt,
    Oge,
    Olt,
    Ole,
    One,
    Ord,
    Uno,
    Ueq,
    Ugt,
    Uge,
    Ult,
    Ule,
    Une,
    True,
}

impl FloatPredicate {
    pub fn from_code(code: u32) -> Option<Self> {
        let predicate = match code {
            predicate::FCMP_FALSE => FloatPredicate::False,
            predicate::FCMP_OEQ => FloatPredicate::Oeq,
            predicate::FCMP_OGT => FloatPredicate::Ogt,
            predicate::FCMP_OGE => FloatPredicate::Oge,
            predicate::FCMP_OLT => FloatPredicate::Olt,
            predicate::FCMP_OLE => FloatPredicate::Ole,
            predicate::FCMP_ONE => FloatPredicate::One,
            predicate::FCMP_ORD => FloatPredicate::Ord,
            predicate::FCMP_UNO => FloatPredicate::Uno,
            predicate::FCMP_UEQ => FloatPredicate::Ueq,
            predicate::FCMP_UGT => FloatPredicate::Ugt,
            predicate::FCMP_UGE => FloatPredicate::Uge,
            predicate::FCMP_ULT => FloatPredicate::Ult,
            predicate::FCMP_ULE => FloatPredicate::Ule,
            predicate::FCMP_UNE => FloatPredicate::Une,
            predicate::FCMP_TRUE => FloatPredicate::True,
            _ => return None,
        };
        Some(predicate)
    }

    /// Single compare (optionally negated) that evaluates each operand once.
    fn direct(self) -> Option<(CompareOp, bool)> {
        let lowering = match self {
            FloatPredicate::Oeq => (CompareOp::Eq, false),
            FloatPredicate::Une => (CompareOp::Eq, true),
            FloatPredicate::Ogt => (CompareOp::Gt, false),
            FloatPredicate::Olt => (CompareOp::Lt, false),
            FloatPredicate::Ugt => (CompareOp::GtUn, false),
            FloatPredicate::Ult => (CompareOp::LtUn, false),
            FloatPredicate::Oge => (CompareOp::LtUn, true),
            FloatPredicate::Ole => (CompareOp::GtUn, true),
            FloatPredicate::Uge => (CompareOp::Lt, true),
            FloatPredicate::Ule => (CompareOp::Gt, true),
            _ => return None,
        };
        Some(lowering)
    }

    pub fn evaluates_once(self) -> bool {
        self.direct().is_some()
    }
}

/// One step of an address computation.
#[derive(Debug, Clone, PartialEq)]
pub enum AddressStep {
    /// Pointer arithmetic over the pointee; does not change the field chain.
    Stride { element: ir::Type, index: OperandRef },
    Field { record: RecordId, index: u32 },
    Element { element: ir::Type, index: OperandRef },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    Alloca {
        allocated: ir::Type,
    },
    Load {
        ty: ir::Type,
        source: Option<NodeId>,
    },
    /// Operands `[value, address]`.
    Store {
        destination: Option<NodeId>,
    },
    Call {
        function_type: ir::FunctionType,
    },
    Invoke {
        function_type: ir::FunctionType,
        normal: BlockId,
        unwind: BlockId,
    },
    IntCompare(IntPredicate),
    FloatCompare(FloatPredicate),
    Convert(Opcode),
    BitCast,
    Branch(BlockId),
    CondBranch {
        then: BlockId,
        otherwise: BlockId,
    },
    Switch {
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Return,
    Phi {
        sources: Vec<BlockId>,
        /// (predecessor block index, value); filled by data-flow analysis.
        incoming: Vec<(usize, OperandRef)>,
    },
    GetElementPtr {
        path: Vec<AddressStep>,
        /// Type addressed by the result.
        target: ir::Type,
    },
    Select,
    VaArg(ir::Type),
    /// Handler blocks first, then the unwind block if any.
    CatchSwitch(Vec<BlockId>),
    CatchPad,
    CatchRet(BlockId),
    CleanupPad,
    CleanupRet(Option<BlockId>),
    LandingPad,
    Resume,
    Unary(Opcode),
    Binary(Opcode),
    Freeze,
    Unreachable,
    /// Opcode without a dedicated lowering; kept with its operands.
    Generic(Opcode),
}

impl InstructionKind {
    pub fn build(
        opcode: Opcode,
        ty: &ir::Type,
        operands: &[OperandRef],
        info: &InstrInfo,
        module: &ModuleContext,
        location: &Location,
    ) -> Result<Self> {
        let block = |index: usize| -> Result<BlockId> {
            match operands.get(index).and_then(OperandRef::as_block) {
                Some(id) => Ok(id),
                None => Err(crate::error::TranslateError::structural(
                    location,
                    StructuralDefect::InvalidOperand(format!(
                        "operand {} of {} must be a block",
                        index, opcode
                    )),
                )),
            }
        };

        let kind = match opcode {
            Opcode::Alloca => {
                if operands.len() > 1 {
                    defect!(
                        location,
                        StructuralDefect::Arity {
                            expected: "0 or 1".to_string(),
                            found: operands.len(),
                        }
                    );
                }
                let InstrInfo::Alloca { allocated } = info else {
                    defect!(
                        location,
                        StructuralDefect::InvalidOperand("alloca without allocated type".into())
                    );
                };
                InstructionKind::Alloca {
                    allocated: allocated.clone(),
                }
            }
            Opcode::Load => {
                ensure_arity!(location, operands, 1);
                InstructionKind::Load {
                    ty: ty.clone(),
                    source: None,
                }
            }
            Opcode::Store => {
                ensure_arity!(location, operands, 2);
                InstructionKind::Store { destination: None }
            }
            Opcode::FNeg => {
                ensure_arity!(location, operands, 1);
                InstructionKind::Unary(opcode)
            }
            Opcode::Add
            | Opcode::FAdd
            | Opcode::Sub
            | Opcode::FSub
            | Opcode::Mul
            | Opcode::FMul
            | Opcode::UDiv
            | Opcode::SDiv
            | Opcode::FDiv
            | Opcode::URem
            | Opcode::SRem
            | Opcode::FRem
            | Opcode::Shl
            | Opcode::LShr
            | Opcode::AShr
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor => {
                ensure_arity!(location, operands, 2);
                InstructionKind::Binary(opcode)
            }
            Opcode::ICmp => {
                ensure_arity!(location, operands, 2);
                let code = predicate_code(info, location)?;
                match IntPredicate::from_code(code) {
                    Some(predicate) => InstructionKind::IntCompare(predicate),
                    None => defect!(location, StructuralDefect::UnknownPredicate(code)),
                }
            }
            Opcode::FCmp => {
                ensure_arity!(location, operands, 2);
                let code = predicate_code(info, location)?;
                match FloatPredicate::from_code(code) {
                    Some(predicate) => InstructionKind::FloatCompare(predicate),
                    None => defect!(location, StructuralDefect::UnknownPredicate(code)),
                }
            }
            Opcode::BitCast | Opcode::AddrSpaceCast => {
                ensure_arity!(location, operands, 1);
                InstructionKind::BitCast
            }
            op if op.is_cast() => {
                ensure_arity!(location, operands, 1);
                InstructionKind::Convert(op)
            }
            Opcode::Br => match operands.len() {
                1 => InstructionKind::Branch(block(0)?),
                3 => InstructionKind::CondBranch {
                    then: block(1)?,
                    otherwise: block(2)?,
                },
                found => defect!(
                    location,
                    StructuralDefect::Arity {
                        expected: "1 or 3".to_string(),
                        found,
                    }
                ),
            },
            Opcode::Switch => {
                if operands.len() < 2 || operands.len() % 2 != 0 {
                    defect!(
                        location,
                        StructuralDefect::Arity {
                            expected: "2 + 2n".to_string(),
                            found: operands.len(),
                        }
                    );
                }
                let mut cases = Vec::with_capacity(operands.len() / 2 - 1);
                for index in (2..operands.len()).step_by(2) {
                    let Some(value) = operands[index].as_const_int() else {
                        defect!(
                            location,
                            StructuralDefect::InvalidOperand("switch case is not a constant".into())
                        );
                    };
                    cases.push((value, block(index + 1)?));
                }
                InstructionKind::Switch {
                    default: block(1)?,
                    cases,
                }
            }
            Opcode::Ret => {
                if operands.len() > 1 {
                    defect!(
                        location,
                        StructuralDefect::Arity {
                            expected: "0 or 1".to_string(),
                            found: operands.len(),
                        }
                    );
                }
                InstructionKind::Return
            }
            Opcode::Phi => {
                let InstrInfo::Phi { incoming_blocks } = info else {
                    defect!(
                        location,
                        StructuralDefect::InvalidOperand("phi without incoming blocks".into())
                    );
                };
                if operands.is_empty() || incoming_blocks.len() != operands.len() {
                    defect!(
                        location,
                        StructuralDefect::Arity {
                            expected: format!("{} (one per incoming block)", incoming_blocks.len()),
                            found: operands.len(),
                        }
                    );
                }
                InstructionKind::Phi {
                    sources: incoming_blocks.clone(),
                    incoming: Vec::new(),
                }
            }
            Opcode::GetElementPtr => {
                if operands.is_empty() {
                    defect!(
                        location,
                        StructuralDefect::Arity {
                            expected: "at least 1".to_string(),
                            found: 0,
                        }
                    );
                }
                let InstrInfo::Gep { source_element, .. } = info else {
                    defect!(
                        location,
                        StructuralDefect::InvalidOperand("getelementptr without source type".into())
                    );
                };
                let (path, target) = address_path(source_element, &operands[1..], module, location)?;
                InstructionKind::GetElementPtr { path, target }
            }
            Opcode::Select => {
                ensure_arity!(location, operands, 3);
                InstructionKind::Select
            }
            Opcode::VAArg => {
                ensure_arity!(location, operands, 1);
                InstructionKind::VaArg(ty.clone())
            }
            Opcode::Call => {
                if operands.is_empty() {
                    defect!(
                        location,
                        StructuralDefect::Arity {
                            expected: "at least 1".to_string(),
                            found: 0,
                        }
                    );
                }
                InstructionKind::Call {
                    function_type: call_type(info, location)?,
                }
            }
            Opcode::Invoke => {
                if operands.len() < 3 {
                    defect!(
                        location,
                        StructuralDefect::Arity {
                            expected: "at least 3".to_string(),
                            found: operands.len(),
                        }
                    );
                }
                let len = operands.len();
                InstructionKind::Invoke {
                    function_type: call_type(info, location)?,
                    normal: block(len - 3)?,
                    unwind: block(len - 2)?,
                }
            }
            Opcode::CatchSwitch => {
                if operands.len() < 2 {
                    defect!(
                        location,
                        StructuralDefect::Arity {
                            expected: "at least 2".to_string(),
                            found: operands.len(),
                        }
                    );
                }
                let targets = (1..operands.len())
                    .map(|index| block(index))
                    .collect::<Result<Vec<_>>>()?;
                InstructionKind::CatchSwitch(targets)
            }
            Opcode::CatchPad => InstructionKind::CatchPad,
            Opcode::CleanupPad => InstructionKind::CleanupPad,
            Opcode::LandingPad => InstructionKind::LandingPad,
            Opcode::CatchRet => {
                ensure_arity!(location, operands, 2);
                InstructionKind::CatchRet(block(1)?)
            }
            Opcode::CleanupRet => match operands.len() {
                1 => InstructionKind::CleanupRet(None),
                2 => InstructionKind::CleanupRet(Some(block(1)?)),
                found => defect!(
                    location,
                    StructuralDefect::Arity {
                        expected: "1 or 2".to_string(),
                        found,
                    }
                ),
            },
            Opcode::Resume => {
                ensure_arity!(location, operands, 1);
                InstructionKind::Resume
            }
            Opcode::Freeze => {
                ensure_arity!(location, operands, 1);
                InstructionKind::Freeze
            }
            Opcode::Unreachable => {
                ensure_arity!(location, operands, 0);
                InstructionKind::Unreachable
            }
            other => InstructionKind::Generic(other),
        };
        Ok(kind)
    }

    /// Source-level successors, in operand order.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstructionKind::Branch(target) | InstructionKind::CatchRet(target) => vec![*target],
            InstructionKind::CondBranch { then, otherwise } => vec![*then, *otherwise],
            InstructionKind::Switch { default, cases } => std::iter::once(*default)
                .chain(cases.iter().map(|(_, target)| *target))
                .collect(),
            InstructionKind::Invoke { normal, unwind, .. } => vec![*normal, *unwind],
            InstructionKind::CatchSwitch(targets) => targets.clone(),
            InstructionKind::CleanupRet(unwind) => unwind.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_exception_construct(&self) -> bool {
        matches!(
            self,
            InstructionKind::Invoke { .. }
                | InstructionKind::CatchSwitch(_)
                | InstructionKind::CatchPad
                | InstructionKind::CatchRet(_)
                | InstructionKind::CleanupPad
                | InstructionKind::CleanupRet(_)
                | InstructionKind::LandingPad
                | InstructionKind::Resume
        )
    }

    /// Operand pushed first by this kind's lowering, if every operand is pushed exactly once
    /// and nothing else is emitted before it.
    pub fn first_evaluated_operand(&self) -> Option<usize> {
        match self {
            InstructionKind::Return
            | InstructionKind::Binary(_)
            | InstructionKind::Unary(_)
            | InstructionKind::IntCompare(_)
            | InstructionKind::Convert(_)
            | InstructionKind::BitCast
            | InstructionKind::CondBranch { .. }
            | InstructionKind::Switch { .. } => Some(0),
            InstructionKind::FloatCompare(predicate) if predicate.evaluates_once() => Some(0),
            _ => None,
        }
    }
}

fn predicate_code(info: &InstrInfo, location: &Location) -> Result<u32> {
    match info {
        InstrInfo::Predicate(code) => Ok(*code),
        _ => defect!(
            location,
            StructuralDefect::InvalidOperand("comparison without predicate".into())
        ),
    }
}

fn call_type(info: &InstrInfo, location: &Location) -> Result<ir::FunctionType> {
    match info {
        InstrInfo::Call { function_type } => Ok(function_type.clone()),
        _ => defect!(
            location,
            StructuralDefect::InvalidOperand("call site without function type".into())
        ),
    }
}

/// Resolves a GEP index path to steps and the addressed type. The first index strides
/// over the source element; every later index selects an aggregate field (constant
/// index) or an array element.
pub fn address_path(
    source_element: &ir::Type,
    indices: &[OperandRef],
    module: &ModuleContext,
    location: &Location,
) -> Result<(Vec<AddressStep>, ir::Type)> {
    let mut steps = Vec::with_capacity(indices.len());
    let Some((first, rest)) = indices.split_first() else {
        return Ok((steps, source_element.clone()));
    };
    steps.push(AddressStep::Stride {
        element: source_element.clone(),
        index: first.clone(),
    });

    let mut current = source_element.clone();
    for index in rest {
        let next = match &current {
            ir::Type::Struct(_) | ir::Type::Literal { .. } => {
                let Some(entry) = module.types().aggregate(&current) else {
                    defect!(
                        location,
                        StructuralDefect::UnregisteredType(current.to_string())
                    );
                };
                let Some(value) = index.as_const_int() else {
                    defect!(
                        location,
                        StructuralDefect::NonConstantFieldIndex {
                            aggregate: entry.name.clone(),
                        }
                    );
                };
                if value < 0 || value as usize >= entry.fields.len() {
                    defect!(
                        location,
                        StructuralDefect::FieldIndexOutOfRange {
                            aggregate: entry.name.clone(),
                            index: value,
                            fields: entry.fields.len(),
                        }
                    );
                }
                steps.push(AddressStep::Field {
                    record: entry.record,
                    index: value as u32,
                });
                entry.fields[value as usize].clone()
            }
            ir::Type::Array(element, _) | ir::Type::Vector(element, _) => {
                steps.push(AddressStep::Element {
                    element: (**element).clone(),
                    index: index.clone(),
                });
                (**element).clone()
            }
            leaf => defect!(
                location,
                StructuralDefect::IndexThroughLeaf {
                    ty: leaf.to_string(),
                }
            ),
        };
        current = next;
    }
    Ok((steps, current))
}

/// Where a node's result lives once lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSlot {
    /// No result, or nobody reads it.
    None,
    /// Left on the evaluation stack for the next node.
    Stack,
    Local(u32),
}

#[derive(Debug, Clone)]
pub struct InstructionNode {
    pub key: ValueKey,
    /// Index of the owning block.
    pub block: usize,
    pub opcode: Opcode,
    pub kind: InstructionKind,
    pub operands: Vec<OperandRef>,
    /// `None` for instructions producing nothing (void, token, label).
    pub result_type: Option<ir::Type>,
    pub loads: BTreeSet<NodeId>,
    pub stores: BTreeSet<NodeId>,
    pub accessors: BTreeSet<NodeId>,
    pub slot: ResultSlot,
}

impl InstructionNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: ValueKey,
        block: usize,
        opcode: Opcode,
        ty: &ir::Type,
        operands: Vec<OperandRef>,
        info: &InstrInfo,
        module: &ModuleContext,
        function: &Location,
    ) -> Result<Self> {
        let location = function.at(key.value(), opcode);
        let kind = InstructionKind::build(opcode, ty, &operands, info, module, &location)?;
        let result_type = match ty {
            ir::Type::Void | ir::Type::Token | ir::Type::Label | ir::Type::Metadata => None,
            other => Some(other.clone()),
        };
        Ok(Self {
            key,
            block,
            opcode,
            kind,
            operands,
            result_type,
            loads: BTreeSet::new(),
            stores: BTreeSet::new(),
            accessors: BTreeSet::new(),
            slot: ResultSlot::None,
        })
    }

    pub fn is_used(&self) -> bool {
        !(self.accessors.is_empty() && self.loads.is_empty() && self.stores.is_empty())
    }

    pub fn lower(&self, emitter: &mut Emitter<'_, '_>) -> Result<()> {
        let location = emitter.location_of(self);
        let operands = &self.operands;
        match &self.kind {
            InstructionKind::Alloca { .. } => {
                if let ResultSlot::Local(local) = self.slot {
                    emitter.emit(Op::InitLocal(local));
                }
            }
            InstructionKind::Load { ty, source } => {
                match emitter.promoted_alloca(*source, ty) {
                    Some(local) => emitter.emit(Op::LoadLocal(local)),
                    None => {
                        emitter.push_operand(&operands[0], &location)?;
                        let sig = emitter.sig(ty, &location)?;
                        emitter.emit(Op::LoadIndirect(sig));
                    }
                }
                emitter.store_result(self);
            }
            InstructionKind::Store { destination } => {
                let value_type = emitter.operand_type(&operands[0]);
                match emitter.promoted_alloca(*destination, &value_type) {
                    Some(local) => {
                        emitter.push_operand(&operands[0], &location)?;
                        emitter.emit(Op::StoreLocal(local));
                    }
                    None => {
                        emitter.push_operand(&operands[1], &location)?;
                        emitter.push_operand(&operands[0], &location)?;
                        let sig = emitter.sig(&value_type, &location)?;
                        emitter.emit(Op::StoreIndirect(sig));
                    }
                }
            }
            InstructionKind::Unary(_) => {
                let kind = emitter.num_kind(&emitter.operand_type(&operands[0]), &location)?;
                emitter.push_operand(&operands[0], &location)?;
                emitter.emit(Op::Unary {
                    op: UnaryOp::Neg,
                    kind,
                });
                emitter.store_result(self);
            }
            InstructionKind::Binary(opcode) => {
                let kind = emitter.num_kind(&emitter.operand_type(&operands[0]), &location)?;
                emitter.push_operand(&operands[0], &location)?;
                emitter.push_operand(&operands[1], &location)?;
                emitter.emit(Op::Binary {
                    op: binary_op(*opcode),
                    kind,
                });
                emitter.store_result(self);
            }
            InstructionKind::IntCompare(predicate) => {
                let kind = emitter.num_kind(&emitter.operand_type(&operands[0]), &location)?;
                let (op, negate) = predicate.lowering();
                emitter.push_operand(&operands[0], &location)?;
                emitter.push_operand(&operands[1], &location)?;
                emitter.emit(Op::Compare { op, kind });
                if negate {
                    emitter.emit(logical_not());
                }
                emitter.store_result(self);
            }
            InstructionKind::FloatCompare(predicate) => {
                let kind = emitter.num_kind(&emitter.operand_type(&operands[0]), &location)?;
                lower_float_compare(*predicate, kind, &operands[0], &operands[1], emitter, &location)?;
                emitter.store_result(self);
            }
            InstructionKind::Convert(opcode) => {
                let from = emitter.num_kind(&emitter.operand_type(&operands[0]), &location)?;
                let to = match &self.result_type {
                    Some(ty) => emitter.num_kind(ty, &location)?,
                    None => defect!(
                        location,
                        StructuralDefect::InvalidOperand("conversion to void".into())
                    ),
                };
                let signed = matches!(opcode, Opcode::SExt | Opcode::FPToSI | Opcode::SIToFP);
                emitter.push_operand(&operands[0], &location)?;
                emitter.emit(Op::Convert { from, to, signed });
                emitter.store_result(self);
            }
            InstructionKind::BitCast => {
                let from = emitter.operand_type(&operands[0]);
                let to = self.result_type.clone().unwrap_or(ir::Type::Void);
                let same = emitter.sig(&from, &location)? == emitter.sig(&to, &location)?;
                if !(same || (from.is_pointer() && to.is_pointer())) {
                    defect!(
                        location,
                        StructuralDefect::InvalidOperand(format!(
                            "bitcast from {} to {} reinterprets the representation",
                            from, to
                        ))
                    );
                }
                emitter.push_operand(&operands[0], &location)?;
                emitter.store_result(self);
            }
            InstructionKind::Freeze => {
                emitter.push_operand(&operands[0], &location)?;
                emitter.store_result(self);
            }
            InstructionKind::Select => {
                let otherwise = emitter.new_label();
                let end = emitter.new_label();
                emitter.push_operand(&operands[0], &location)?;
                emitter.emit(Op::BranchFalse(otherwise));
                emitter.push_operand(&operands[1], &location)?;
                emitter.store_result(self);
                emitter.emit(Op::Branch(end));
                emitter.mark_label(otherwise);
                emitter.push_operand(&operands[2], &location)?;
                emitter.store_result(self);
                emitter.mark_label(end);
            }
            InstructionKind::VaArg(ty) => {
                emitter.push_operand(&operands[0], &location)?;
                let sig = emitter.sig(ty, &location)?;
                emitter.emit(Op::NextVarArg(sig));
                emitter.store_result(self);
            }
            InstructionKind::GetElementPtr { path, .. } => {
                emitter.push_operand(&operands[0], &location)?;
                for step in path {
                    match step {
                        AddressStep::Stride { element, index } => {
                            if index.as_const_int() == Some(0) {
                                continue;
                            }
                            emitter.push_operand(index, &location)?;
                            let sig = emitter.sig(element, &location)?;
                            emitter.emit(Op::ElementAddress(sig));
                        }
                        AddressStep::Field { record, index } => {
                            emitter.emit(Op::FieldAddress {
                                record: *record,
                                field: *index,
                            });
                        }
                        AddressStep::Element { element, index } => {
                            emitter.push_operand(index, &location)?;
                            let sig = emitter.sig(element, &location)?;
                            emitter.emit(Op::ElementAddress(sig));
                        }
                    }
                }
                emitter.store_result(self);
            }
            InstructionKind::Call { function_type } => {
                let Some((callee, args)) = operands.split_last() else {
                    defect!(
                        location,
                        StructuralDefect::Arity {
                            expected: "at least 1".to_string(),
                            found: 0,
                        }
                    );
                };
                let target = emitter.module().call_target(callee, &location)?;
                lower_call_site(self, &target, callee, args, function_type, emitter, &location)?;
            }
            InstructionKind::Invoke {
                function_type,
                normal,
                unwind,
            } => {
                let len = operands.len();
                let callee = &operands[len - 1];
                let args = &operands[..len - 3];
                let target = emitter.module().call_target(callee, &location)?;
                if emitter.module().target_may_throw(&target) {
                    // the handler jumps straight to the unwind block
                    emitter.emit_edge_copies(self.block, *unwind, &location)?;
                    let normal_label = emitter.edge_label(self.block, *normal, &location)?;
                    let try_start = emitter.new_label();
                    let try_end = emitter.new_label();
                    let handler_start = emitter.new_label();
                    let handler_end = emitter.new_label();
                    let exception = emitter.exception_local();
                    let unwind_label = emitter.block_label(*unwind, &location)?;

                    emitter.mark_label(try_start);
                    lower_call_site(self, &target, callee, args, function_type, emitter, &location)?;
                    emitter.emit(Op::Leave(normal_label));
                    emitter.mark_label(try_end);
                    emitter.mark_label(handler_start);
                    emitter.emit(Op::StoreLocal(exception));
                    emitter.emit(Op::Leave(unwind_label));
                    emitter.mark_label(handler_end);
                    emitter.add_region(try_start, try_end, handler_start, handler_end);
                } else {
                    lower_call_site(self, &target, callee, args, function_type, emitter, &location)?;
                    emitter.jump(self.block, *normal, &location)?;
                }
            }
            InstructionKind::Branch(target) => emitter.jump(self.block, *target, &location)?,
            InstructionKind::CondBranch { then, otherwise } => {
                emitter.push_operand(&operands[0], &location)?;
                let then_label = emitter.edge_label(self.block, *then, &location)?;
                emitter.emit(Op::BranchTrue(then_label));
                emitter.jump(self.block, *otherwise, &location)?;
            }
            InstructionKind::Switch { default, cases } => {
                let scrutinee = emitter.operand_type(&operands[0]);
                let width = match emitter.num_kind(&scrutinee, &location)? {
                    NumKind::Int(width) => Some(width),
                    _ => None,
                };
                emitter.push_operand(&operands[0], &location)?;
                let mut targets = Vec::with_capacity(cases.len());
                for (value, target) in cases {
                    let value = i128::from(*value);
                    let value = width.map(|w| w.normalize(value)).unwrap_or(value);
                    targets.push((value, emitter.edge_label(self.block, *target, &location)?));
                }
                let default = emitter.edge_label(self.block, *default, &location)?;
                emitter.emit(Op::SwitchValue {
                    cases: targets,
                    default,
                });
            }
            InstructionKind::Return => {
                match operands.first() {
                    Some(value) => emitter.push_operand(value, &location)?,
                    None if !emitter.returns_void() => {
                        defect!(location, StructuralDefect::ReturnWithoutValue)
                    }
                    None => {}
                }
                emitter.emit(Op::Return);
            }
            InstructionKind::Phi { .. } => {}
            InstructionKind::CatchSwitch(targets) => {
                // Always the first handler: the only exceptions raised at run time are
                // runtime failures, which carry no type for catchpad clauses to match.
                // Later handlers are unreachable. The saved exception is already in its local.
                emitter.jump(self.block, targets[0], &location)?;
            }
            InstructionKind::CatchPad | InstructionKind::CleanupPad | InstructionKind::LandingPad => {
                emitter.emit(Op::Nop);
            }
            InstructionKind::CatchRet(target) => emitter.jump(self.block, *target, &location)?,
            InstructionKind::CleanupRet(Some(unwind)) => {
                emitter.jump(self.block, *unwind, &location)?
            }
            InstructionKind::CleanupRet(None) | InstructionKind::Resume => {
                let exception = emitter.exception_local();
                emitter.emit(Op::LoadLocal(exception));
                emitter.emit(Op::Throw);
            }
            InstructionKind::Unreachable => emitter.emit(Op::Unreachable),
            InstructionKind::Generic(opcode) => {
                if self.is_used() {
                    defect!(location, StructuralDefect::UnsupportedOpcode(*opcode));
                }
                emitter.emit(Op::Nop);
            }
        }
        Ok(())
    }
}

fn logical_not() -> Op {
    Op::Unary {
        op: UnaryOp::LogicalNot,
        kind: NumKind::Bool,
    }
}

fn binary_op(opcode: Opcode) -> BinaryOp {
    match opcode {
        Opcode::Add | Opcode::FAdd => BinaryOp::Add,
        Opcode::Sub | Opcode::FSub => BinaryOp::Sub,
        Opcode::Mul | Opcode::FMul => BinaryOp::Mul,
        Opcode::SDiv | Opcode::FDiv => BinaryOp::Div,
        Opcode::UDiv => BinaryOp::DivUn,
        Opcode::SRem | Opcode::FRem => BinaryOp::Rem,
        Opcode::URem => BinaryOp::RemUn,
        Opcode::And => BinaryOp::And,
        Opcode::Or => BinaryOp::Or,
        Opcode::Xor => BinaryOp::Xor,
        Opcode::Shl => BinaryOp::Shl,
        Opcode::AShr => BinaryOp::Shr,
        _ => BinaryOp::ShrUn,
    }
}

fn lower_float_compare(
    predicate: FloatPredicate,
    kind: NumKind,
    lhs: &OperandRef,
    rhs: &OperandRef,
    emitter: &mut Emitter<'_, '_>,
    location: &Location,
) -> Result<()> {
    let compare = |op| Op::Compare { op, kind };
    let bool_op = |op| Op::Binary {
        op,
        kind: NumKind::Bool,
    };
    if let Some((op, negate)) = predicate.direct() {
        emitter.push_operand(lhs, location)?;
        emitter.push_operand(rhs, location)?;
        emitter.emit(compare(op));
        if negate {
            emitter.emit(logical_not());
        }
        return Ok(());
    }
    match predicate {
        FloatPredicate::False | FloatPredicate::True => {
            emitter.load_const(Const::Bool(predicate == FloatPredicate::True));
        }
        FloatPredicate::One | FloatPredicate::Ueq => {
            // ordered-less or ordered-greater
            emitter.push_operand(lhs, location)?;
            emitter.push_operand(rhs, location)?;
            emitter.emit(compare(CompareOp::Lt));
            emitter.push_operand(lhs, location)?;
            emitter.push_operand(rhs, location)?;
            emitter.emit(compare(CompareOp::Gt));
            emitter.emit(bool_op(BinaryOp::Or));
            if predicate == FloatPredicate::Ueq {
                emitter.emit(logical_not());
            }
        }
        FloatPredicate::Ord | FloatPredicate::Uno => {
            // a value is ordered iff it equals itself
            emitter.push_operand(lhs, location)?;
            emitter.push_operand(lhs, location)?;
            emitter.emit(compare(CompareOp::Eq));
            emitter.push_operand(rhs, location)?;
            emitter.push_operand(rhs, location)?;
            emitter.emit(compare(CompareOp::Eq));
            emitter.emit(bool_op(BinaryOp::And));
            if predicate == FloatPredicate::Uno {
                emitter.emit(logical_not());
            }
        }
        _ => defect!(location, StructuralDefect::UnknownPredicate(u32::MAX)),
    }
    Ok(())
}

/// Pushes the arguments, calls the resolved target and stores the result.
fn lower_call_site(
    node: &InstructionNode,
    target: &CallTarget,
    callee: &OperandRef,
    args: &[OperandRef],
    function_type: &ir::FunctionType,
    emitter: &mut Emitter<'_, '_>,
    location: &Location,
) -> Result<()> {
    let fixed = function_type.params.len();
    let returns = !function_type.ret.is_void();
    match target {
        CallTarget::Method {
            index,
            signature,
            ..
        } => {
            if args.len() < signature.params.len() {
                defect!(
                    location,
                    StructuralDefect::Arity {
                        expected: format!("{} arguments", signature.params.len()),
                        found: args.len(),
                    }
                );
            }
            if signature.ret.is_void() != node.result_type.is_none() {
                defect!(
                    location,
                    StructuralDefect::InvalidOperand(
                        "call site result does not match the callee signature".into()
                    )
                );
            }
            push_arguments(args, signature.params.len(), signature.variadic, emitter, location)?;
            emitter.emit(Op::Call {
                method: *index,
                arg_count: signature.arg_slots() as u32,
            });
            if !signature.ret.is_void() {
                emitter.store_result(node);
            }
        }
        CallTarget::Runtime(RuntimeRoute::Entry(entry)) => {
            let needed = entry.arity() as usize;
            let memory = matches!(
                entry,
                RuntimeEntry::MemCopy | RuntimeEntry::MemMove | RuntimeEntry::MemSet
            );
            // the trailing isVolatile flag of the memory intrinsics is dropped;
            // termination ignores its diagnostic arguments
            let drops_flag = memory && args.len() == needed + 1;
            let terminates = *entry == RuntimeEntry::Terminate;
            if args.len() != needed && !drops_flag && !terminates {
                defect!(
                    location,
                    StructuralDefect::Arity {
                        expected: format!("{} arguments for {}", needed, entry),
                        found: args.len(),
                    }
                );
            }
            for arg in &args[..needed] {
                emitter.push_operand(arg, location)?;
            }
            emitter.emit(Op::CallRuntime {
                entry: *entry,
                arg_count: needed as u32,
            });
            if !entry.returns().is_void() {
                emitter.store_result(node);
            } else if node.result_type.is_some() {
                // the C memory functions return their destination
                if !memory {
                    defect!(
                        location,
                        StructuralDefect::InvalidOperand(format!("{} produces no value", entry))
                    );
                }
                emitter.push_operand(&args[0], location)?;
                emitter.store_result(node);
            }
        }
        CallTarget::Runtime(RuntimeRoute::VaStart) => {
            ensure_arity!(location, args, 1);
            let Some(cursor) = emitter.varargs_argument() else {
                defect!(
                    location,
                    StructuralDefect::InvalidOperand("va_start in a non-variadic function".into())
                );
            };
            emitter.push_operand(&args[0], location)?;
            emitter.emit(Op::LoadArg(cursor));
            emitter.emit(Op::StoreIndirect(TypeSig::VarArgs));
        }
        CallTarget::Runtime(RuntimeRoute::VaEnd) => {
            for arg in args {
                emitter.push_operand(arg, location)?;
                emitter.emit(Op::Pop);
            }
        }
        CallTarget::Indirect => {
            if args.len() < fixed {
                defect!(
                    location,
                    StructuralDefect::Arity {
                        expected: format!("{} arguments", fixed),
                        found: args.len(),
                    }
                );
            }
            push_arguments(args, fixed, function_type.variadic, emitter, location)?;
            emitter.push_operand(callee, location)?;
            emitter.emit(Op::CallIndirect {
                arg_count: (fixed + usize::from(function_type.variadic)) as u32,
                returns,
            });
            if returns {
                emitter.store_result(node);
            }
        }
    }
    Ok(())
}

fn push_arguments(
    args: &[OperandRef],
    fixed: usize,
    variadic: bool,
    emitter: &mut Emitter<'_, '_>,
    location: &Location,
) -> Result<()> {
    for arg in &args[..fixed] {
        emitter.push_operand(arg, location)?;
    }
    if variadic {
        for arg in &args[fixed..] {
            emitter.push_operand(arg, location)?;
        }
        emitter.emit(Op::PackVarArgs((args.len() - fixed) as u32));
    } else if args.len() > fixed {
        defect!(
            location,
            StructuralDefect::Arity {
                expected: format!("{} arguments", fixed),
                found: args.len(),
            }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_llvm_float_predicate_is_known() {
        for code in predicate::FCMP_FALSE..=predicate::FCMP_TRUE {
            assert!(FloatPredicate::from_code(code).is_some(), "{}", code);
        }
        assert!(FloatPredicate::from_code(16).is_none());
        assert!(FloatPredicate::from_code(predicate::ICMP_EQ).is_none());
    }

    #[test]
    fn every_llvm_int_predicate_is_known() {
        for code in predicate::ICMP_EQ..=predicate::ICMP_SLE {
            assert!(IntPredicate::from_code(code).is_some(), "{}", code);
        }
        assert!(IntPredicate::from_code(42).is_none());
    }

    #[test]
    fn relational_float_predicates_evaluate_once() {
        let once = [
            FloatPredicate::Oeq,
            FloatPredicate::Une,
            FloatPredicate::Ogt,
            FloatPredicate::Oge,
            FloatPredicate::Olt,
            FloatPredicate::Ole,
            FloatPredicate::Ugt,
            FloatPredicate::Uge,
            FloatPredicate::Ult,
            FloatPredicate::Ule,
        ];
        for predicate in once {
            assert!(predicate.evaluates_once(), "{:?}", predicate);
        }
        assert!(!FloatPredicate::One.evaluates_once());
        assert!(!FloatPredicate::Ord.evaluates_once());
    }

    #[test]
    fn branch_successors_follow_operand_order() {
        let kind = InstructionKind::Switch {
            default: BlockId(9),
            cases: vec![(1, BlockId(3)), (2, BlockId(4))],
        };
        assert_eq!(kind.successors(), vec![BlockId(9), BlockId(3), BlockId(4)]);
    }
}
