use crate::defect;
use crate::error::{Location, Result, StructuralDefect};
use crate::instruction::{InstructionNode, NodeId, OperandRef, ValueKey};
use crate::module::ModuleContext;
use ib_ir::{self as ir, BlockId, ConstExpr, InstrInfo, Opcode, Operand};

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub name: Option<String>,
    pub instructions: Vec<NodeId>,
    /// Block indices, duplicate-free.
    pub predecessors: Vec<usize>,
    pub successors: Vec<usize>,
}

impl BasicBlock {
    pub fn new(source: &ir::Block) -> Self {
        Self {
            id: source.id,
            name: source.name.clone(),
            instructions: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn add_successor(&mut self, index: usize) -> bool {
        if self.successors.contains(&index) {
            return false;
        }
        self.successors.push(index);
        true
    }

    pub fn add_predecessor(&mut self, index: usize) {
        if !self.predecessors.contains(&index) {
            self.predecessors.push(index);
        }
    }

    pub fn terminator(&self) -> Option<NodeId> {
        self.instructions.last().copied()
    }
}

/// Appends the nodes of one source block to the function's arena. Constant
/// expressions nested in operand lists become synthesized nodes placed right before
/// their consumer. Those feeding a phi are recorded in `hoisted` against the incoming
/// block, which evaluates them ahead of its terminator.
pub struct BlockLowering<'m, 'a> {
    pub module: &'m ModuleContext<'a>,
    pub location: &'m Location,
    pub block: usize,
    pub nodes: &'m mut Vec<InstructionNode>,
    pub synthesized: &'m mut u32,
    pub hoisted: &'m mut Vec<(BlockId, NodeId)>,
}

struct Frame<'e> {
    expr: &'e ConstExpr,
    next: usize,
    resolved: Vec<OperandRef>,
}

impl<'e> Frame<'e> {
    fn new(expr: &'e ConstExpr) -> Self {
        Self {
            expr,
            next: 0,
            resolved: Vec::with_capacity(expr.operands.len()),
        }
    }
}

impl BlockLowering<'_, '_> {
    pub fn push_instruction(&mut self, inst: &ir::Instruction) -> Result<Vec<NodeId>> {
        let mut created = Vec::new();
        let mut budget = self.module.options().max_constant_expression_nodes;
        let incoming_blocks: &[BlockId] = match &inst.info {
            InstrInfo::Phi { incoming_blocks } if inst.opcode == Opcode::Phi => {
                incoming_blocks.as_slice()
            }
            _ => &[],
        };
        let mut operands = Vec::with_capacity(inst.operands.len());
        for (position, operand) in inst.operands.iter().enumerate() {
            let resolved = match (leaf_operand(operand), incoming_blocks.get(position)) {
                (Some(leaf), _) => leaf,
                (None, Some(&predecessor)) => {
                    let mut edge_nodes = Vec::new();
                    let resolved = self.flatten(operand, &mut budget, &mut edge_nodes, inst)?;
                    self.hoisted
                        .extend(edge_nodes.into_iter().map(|id| (predecessor, id)));
                    resolved
                }
                (None, None) => self.flatten(operand, &mut budget, &mut created, inst)?,
            };
            operands.push(resolved);
        }
        let node = InstructionNode::new(
            ValueKey::Value(inst.id),
            self.block,
            inst.opcode,
            &inst.ty,
            operands,
            &inst.info,
            self.module,
            self.location,
        )?;
        created.push(self.append(node));
        Ok(created)
    }

    fn append(&mut self, node: InstructionNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Post-order over the expression tree with an explicit frame stack, so the
    /// nesting depth of the source never reaches the call stack.
    fn flatten(
        &mut self,
        root: &Operand,
        budget: &mut usize,
        created: &mut Vec<NodeId>,
        consumer: &ir::Instruction,
    ) -> Result<OperandRef> {
        let location = self.location.at(Some(consumer.id), consumer.opcode);
        let Operand::Expr(root) = root else {
            defect!(
                location,
                StructuralDefect::InvalidOperand("expected a constant expression".into())
            );
        };
        let limit = self.module.options().max_constant_expression_nodes;
        let mut stack = vec![Frame::new(root)];
        while let Some(mut frame) = stack.pop() {
            let expr = frame.expr;
            if let Some(operand) = expr.operands.get(frame.next) {
                frame.next += 1;
                let child = match leaf_operand(operand) {
                    Some(leaf) => {
                        frame.resolved.push(leaf);
                        None
                    }
                    None => match operand {
                        Operand::Expr(child) => Some(Frame::new(child)),
                        _ => None,
                    },
                };
                stack.push(frame);
                stack.extend(child);
                continue;
            }

            if *budget == 0 {
                defect!(location, StructuralDefect::ConstantExpressionLimit(limit));
            }
            *budget -= 1;

            let key = *self.synthesized;
            *self.synthesized += 1;
            let node = InstructionNode::new(
                ValueKey::Synthesized(key),
                self.block,
                frame.expr.opcode,
                &frame.expr.ty,
                frame.resolved,
                &frame.expr.info,
                self.module,
                self.location,
            )?;
            created.push(self.append(node));

            let reference = OperandRef::Synthesized(key);
            match stack.last_mut() {
                Some(parent) => parent.resolved.push(reference),
                None => return Ok(reference),
            }
        }
        defect!(
            location,
            StructuralDefect::InvalidOperand("empty constant expression".into())
        )
    }
}

/// `None` for constant expressions, which need flattening.
fn leaf_operand(operand: &Operand) -> Option<OperandRef> {
    let leaf = match operand {
        Operand::Value(id) => OperandRef::Value(*id),
        Operand::Const(constant) => OperandRef::Const(constant.clone()),
        Operand::Block(id) => OperandRef::Block(*id),
        Operand::Global(name) => OperandRef::Global(name.clone()),
        Operand::Function(name) => OperandRef::Function(name.clone()),
        Operand::Expr(_) => return None,
    };
    Some(leaf)
}
