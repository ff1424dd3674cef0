use crate::defect;
use crate::error::{Location, Result, StructuralDefect, TranslateError};
use crate::function::FunctionContext;
use crate::instruction::{InstructionKind, InstructionNode, NodeId, OperandRef, ResultSlot};
use crate::module::ModuleContext;
use ib_bytecode::{
    Const, LabelId, MethodBody, MethodBodyBuilder, NumKind, Op, TargetModule, TypeSig,
};
use ib_ir::{self as ir, BlockId, Constant};
use tracing::trace;

/// Edge whose phi copies run at a dedicated label before jumping into the target.
#[derive(Debug)]
struct Trampoline {
    label: LabelId,
    from: usize,
    to: usize,
}

/// Op-level state while lowering one function body.
pub struct Emitter<'f, 'a> {
    module: &'f ModuleContext<'a>,
    function: &'f FunctionContext<'a>,
    output: &'f mut TargetModule,
    body: MethodBodyBuilder,
    block_labels: Vec<LabelId>,
    trampolines: Vec<Trampoline>,
    exception: Option<u32>,
}

impl<'f, 'a> Emitter<'f, 'a> {
    pub fn new(
        module: &'f ModuleContext<'a>,
        function: &'f FunctionContext<'a>,
        output: &'f mut TargetModule,
        mut body: MethodBodyBuilder,
    ) -> Self {
        let block_labels = function.blocks.iter().map(|_| body.new_label()).collect();
        Self {
            module,
            function,
            output,
            body,
            block_labels,
            trampolines: Vec::new(),
            exception: None,
        }
    }

    pub fn module(&self) -> &'f ModuleContext<'a> {
        self.module
    }

    pub fn location_of(&self, node: &InstructionNode) -> Location {
        self.function.location().at(node.key.value(), node.opcode)
    }

    pub fn emit(&mut self, op: Op) {
        self.body.emit(op);
    }

    pub fn new_label(&mut self) -> LabelId {
        self.body.new_label()
    }

    pub fn mark_label(&mut self, label: LabelId) {
        self.body.mark_label(label);
    }

    pub fn add_region(
        &mut self,
        try_start: LabelId,
        try_end: LabelId,
        handler_start: LabelId,
        handler_end: LabelId,
    ) {
        trace!(
            "protected region L{}..L{} in {}",
            try_start.0,
            try_end.0,
            self.function.name
        );
        self.body
            .add_region(try_start, try_end, handler_start, handler_end);
    }

    pub fn begin_block(&mut self, index: usize) {
        let label = self.block_labels[index];
        self.body.mark_label(label);
    }

    pub fn load_const(&mut self, value: Const) {
        let index = self.output.push_const(value);
        self.body.emit(Op::LoadConst(index));
    }

    pub fn sig(&self, ty: &ir::Type, location: &Location) -> Result<TypeSig> {
        match self.module.types().lookup(ty) {
            Some(sig) => Ok(sig.clone()),
            None => defect!(location, StructuralDefect::UnregisteredType(ty.to_string())),
        }
    }

    pub fn num_kind(&self, ty: &ir::Type, location: &Location) -> Result<NumKind> {
        match self.sig(ty, location)?.num_kind() {
            Some(kind) => Ok(kind),
            None => defect!(
                location,
                StructuralDefect::InvalidOperand(format!("{} is not a numeric type", ty))
            ),
        }
    }

    /// Source type of an operand; unresolvable values report `void`.
    pub fn operand_type(&self, operand: &OperandRef) -> ir::Type {
        match operand {
            OperandRef::Value(_) | OperandRef::Synthesized(_) => {
                if let OperandRef::Value(id) = operand {
                    if let Some(param) = self.function.param(*id) {
                        return param.ty.clone();
                    }
                }
                operand
                    .key()
                    .and_then(|key| self.function.node_for(key))
                    .and_then(|id| self.function.node(id).result_type.clone())
                    .unwrap_or(ir::Type::Void)
            }
            OperandRef::Const(constant) => constant.ty(),
            OperandRef::Global(_) | OperandRef::Function(_) => ir::Type::Pointer,
            OperandRef::Block(_) => ir::Type::Label,
        }
    }

    pub fn push_operand(&mut self, operand: &OperandRef, location: &Location) -> Result<()> {
        match operand {
            OperandRef::Value(_) | OperandRef::Synthesized(_) => {
                if let OperandRef::Value(id) = operand {
                    if let Some(index) = self.function.param_index(*id) {
                        self.body.emit(Op::LoadArg(index));
                        return Ok(());
                    }
                }
                let Some(id) = operand.key().and_then(|key| self.function.node_for(key)) else {
                    defect!(
                        location,
                        StructuralDefect::InvalidOperand(format!("unknown value {:?}", operand))
                    );
                };
                let producer = self.function.node(id);
                match (&producer.kind, producer.slot) {
                    (InstructionKind::Alloca { .. }, ResultSlot::Local(local)) => {
                        self.body.emit(Op::LoadLocalAddress(local))
                    }
                    (_, ResultSlot::Local(local)) => self.body.emit(Op::LoadLocal(local)),
                    (_, ResultSlot::Stack) => {}
                    (_, ResultSlot::None) => defect!(
                        location,
                        StructuralDefect::InvalidOperand(format!(
                            "value {:?} is used but produces no result",
                            operand
                        ))
                    ),
                }
            }
            OperandRef::Const(constant) => {
                let value = self.constant(constant, location)?;
                self.load_const(value);
            }
            OperandRef::Global(name) => match self.module.static_index(name) {
                Some(index) => self.body.emit(Op::LoadStaticAddress(index)),
                None => {
                    return Err(TranslateError::UnresolvedSymbol {
                        location: location.clone(),
                        symbol: name.clone(),
                    })
                }
            },
            OperandRef::Function(name) => match self.module.method_entry(name) {
                Some(entry) => self.body.emit(Op::LoadMethodPointer(entry.index)),
                None => {
                    return Err(TranslateError::UnresolvedSymbol {
                        location: location.clone(),
                        symbol: name.clone(),
                    })
                }
            },
            OperandRef::Block(id) => defect!(
                location,
                StructuralDefect::InvalidOperand(format!("block {} used as a value", id))
            ),
        }
        Ok(())
    }

    fn constant(&self, constant: &Constant, location: &Location) -> Result<Const> {
        let value = match constant {
            Constant::Int { ty, value } => match self.sig(ty, location)? {
                TypeSig::Bool => Const::Bool(value & 1 != 0),
                TypeSig::Int(width) => Const::Int {
                    width,
                    value: width.normalize(i128::from(*value)),
                },
                other => defect!(
                    location,
                    StructuralDefect::InvalidOperand(format!(
                        "integer constant of non-integer type {:?}",
                        other
                    ))
                ),
            },
            Constant::Float { ty, value } => match self.sig(ty, location)?.num_kind() {
                Some(NumKind::Float(kind)) => Const::Float {
                    kind,
                    value: *value,
                },
                _ => defect!(
                    location,
                    StructuralDefect::InvalidOperand(format!("float constant of type {}", ty))
                ),
            },
            Constant::Null | Constant::NoneToken => Const::Null,
            Constant::Undef(ty) | Constant::Poison(ty) | Constant::Zero(ty) => {
                match self.sig(ty, location)? {
                    TypeSig::Void => Const::Null,
                    sig => Const::Default(sig),
                }
            }
        };
        Ok(value)
    }

    /// Stores the value just produced by `node`, or drops it when nobody reads it.
    pub fn store_result(&mut self, node: &InstructionNode) {
        match node.slot {
            ResultSlot::Local(local) => self.body.emit(Op::StoreLocal(local)),
            ResultSlot::Stack => {}
            ResultSlot::None => self.body.emit(Op::Pop),
        }
    }

    /// Local of the alloca `address` resolves to, when the access covers the whole
    /// allocated object.
    pub fn promoted_alloca(&self, address: Option<NodeId>, ty: &ir::Type) -> Option<u32> {
        let node = self.function.node(address?);
        match (&node.kind, node.slot) {
            (InstructionKind::Alloca { allocated }, ResultSlot::Local(local)) if allocated == ty => {
                Some(local)
            }
            _ => None,
        }
    }

    pub fn returns_void(&self) -> bool {
        self.function.source().is_void_return()
    }

    /// Argument slot holding the packed trailing arguments.
    pub fn varargs_argument(&self) -> Option<u32> {
        let source = self.function.source();
        source
            .is_variadic()
            .then_some(source.params.len() as u32)
    }

    pub fn exception_local(&mut self) -> u32 {
        match self.exception {
            Some(local) => local,
            None => {
                let local = self.body.add_local(TypeSig::opaque_pointer());
                self.exception = Some(local);
                local
            }
        }
    }

    pub fn block_label(&self, id: BlockId, location: &Location) -> Result<LabelId> {
        match self.function.block_index(id) {
            Some(index) => Ok(self.block_labels[index]),
            None => defect!(location, StructuralDefect::MissingBlock(id)),
        }
    }

    fn has_phis(&self, block: usize) -> bool {
        self.function.blocks[block]
            .instructions
            .iter()
            .any(|id| matches!(self.function.node(*id).kind, InstructionKind::Phi { .. }))
    }

    /// Label to transfer to for the edge `from -> to`. Edges carrying phi copies get
    /// a trampoline, emitted after the current block.
    pub fn edge_label(&mut self, from: usize, to: BlockId, location: &Location) -> Result<LabelId> {
        let Some(target) = self.function.block_index(to) else {
            defect!(location, StructuralDefect::MissingBlock(to));
        };
        if !self.has_phis(target) {
            return Ok(self.block_labels[target]);
        }
        if let Some(existing) = self
            .trampolines
            .iter()
            .find(|t| t.from == from && t.to == target)
        {
            return Ok(existing.label);
        }
        let label = self.body.new_label();
        self.trampolines.push(Trampoline {
            label,
            from,
            to: target,
        });
        Ok(label)
    }

    /// Parallel copy for the edge: every incoming value is pushed before any phi local
    /// is written, so phis reading each other see the old values.
    pub fn emit_edge_copies(&mut self, from: usize, to: BlockId, location: &Location) -> Result<()> {
        let Some(target) = self.function.block_index(to) else {
            defect!(location, StructuralDefect::MissingBlock(to));
        };
        self.copies_into(from, target, location)
    }

    fn copies_into(&mut self, from: usize, target: usize, location: &Location) -> Result<()> {
        let function = self.function;
        let mut locals = Vec::new();
        for id in &function.blocks[target].instructions {
            let node = function.node(*id);
            let InstructionKind::Phi { incoming, .. } = &node.kind else {
                continue;
            };
            let Some((_, value)) = incoming.iter().find(|(pred, _)| *pred == from) else {
                defect!(
                    location,
                    StructuralDefect::PhiMismatch(function.blocks[from].id)
                );
            };
            let ResultSlot::Local(local) = node.slot else {
                defect!(
                    location,
                    StructuralDefect::InvalidOperand("phi without a local".into())
                );
            };
            self.push_operand(value, location)?;
            locals.push(local);
        }
        for local in locals.into_iter().rev() {
            self.body.emit(Op::StoreLocal(local));
        }
        Ok(())
    }

    /// Unconditional transfer along an edge: copies inline, then branch.
    pub fn jump(&mut self, from: usize, to: BlockId, location: &Location) -> Result<()> {
        self.emit_edge_copies(from, to, location)?;
        let label = self.block_label(to, location)?;
        self.body.emit(Op::Branch(label));
        Ok(())
    }

    pub fn flush_trampolines(&mut self) -> Result<()> {
        let location = self.function.location().clone();
        for trampoline in std::mem::take(&mut self.trampolines) {
            self.body.mark_label(trampoline.label);
            self.copies_into(trampoline.from, trampoline.to, &location)?;
            self.body
                .emit(Op::Branch(self.block_labels[trampoline.to]));
        }
        Ok(())
    }

    pub fn finish(self) -> Result<MethodBody> {
        Ok(self.body.finish()?)
    }
}
