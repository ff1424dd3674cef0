use crate::block::{BasicBlock, BlockLowering};
use crate::defect;
use crate::emit::Emitter;
use crate::error::{Location, Result, StructuralDefect};
use crate::instruction::{InstructionKind, InstructionNode, NodeId, OperandRef, ResultSlot, ValueKey};
use crate::module::{MethodEntry, ModuleContext};
use ib_bytecode::{MethodBody, MethodBodyBuilder, TargetModule, TypeSig};
use ib_ir::{self as ir, BlockId, ValueId};
use std::collections::HashMap;
use tracing::{debug, trace};

enum Edge {
    Load,
    Store,
    Access,
}

/// Moves the constant-expression nodes feeding phis into their incoming blocks, in
/// creation order, just before each block's terminator.
fn place_hoisted(
    blocks: &mut [BasicBlock],
    nodes: &mut [InstructionNode],
    hoisted: Vec<(BlockId, NodeId)>,
    location: &Location,
) -> Result<()> {
    for (predecessor, id) in hoisted {
        let Some(index) = blocks.iter().position(|block| block.id == predecessor) else {
            defect!(location, StructuralDefect::MissingBlock(predecessor));
        };
        nodes[id.index()].block = index;
        let instructions = &mut blocks[index].instructions;
        let at = instructions.len().saturating_sub(1);
        instructions.insert(at, id);
    }
    Ok(())
}

/// Translation unit for one defined function: its blocks, instruction nodes and the
/// derived control/data-flow graph.
#[derive(Debug)]
pub struct FunctionContext<'a> {
    source: &'a ir::Function,
    pub name: String,
    location: Location,
    pub blocks: Vec<BasicBlock>,
    pub nodes: Vec<InstructionNode>,
    lookup: HashMap<ValueKey, NodeId>,
    params: HashMap<ValueId, u32>,
    block_index: HashMap<BlockId, usize>,
    personality: Option<&'a ir::Function>,
}

impl<'a> FunctionContext<'a> {
    /// Builds every block, then links blocks and runs data-flow analysis. The graph is
    /// complete when this returns.
    pub fn create(entry: &MethodEntry<'a>, module: &ModuleContext<'a>) -> Result<Self> {
        let source = entry.function;
        let location = Location::function(entry.name.clone());
        debug!("building function {} ({})", entry.name, source.name);

        let mut nodes = Vec::new();
        let mut blocks = Vec::with_capacity(source.blocks.len());
        let mut synthesized = 0;
        let mut hoisted = Vec::new();
        for (index, source_block) in source.blocks.iter().enumerate() {
            let mut block = BasicBlock::new(source_block);
            let mut lowering = BlockLowering {
                module,
                location: &location,
                block: index,
                nodes: &mut nodes,
                synthesized: &mut synthesized,
                hoisted: &mut hoisted,
            };
            for inst in &source_block.instructions {
                block.instructions.extend(lowering.push_instruction(inst)?);
            }
            blocks.push(block);
        }
        place_hoisted(&mut blocks, &mut nodes, hoisted, &location)?;

        let lookup = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.key, NodeId(index as u32)))
            .collect();
        let params = source
            .params
            .iter()
            .enumerate()
            .map(|(index, param)| (param.id, index as u32))
            .collect();
        let block_index = blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.id, index))
            .collect();

        let mut context = Self {
            source,
            name: entry.name.clone(),
            location,
            blocks,
            nodes,
            lookup,
            params,
            block_index,
            personality: None,
        };
        context.link_blocks()?;
        context.analyze_data_flow()?;
        context.personality = context.resolve_personality(module)?;
        trace!(
            "{}: {} blocks, {} nodes ({} synthesized)",
            context.name,
            context.blocks.len(),
            context.nodes.len(),
            synthesized
        );
        Ok(context)
    }

    pub fn source(&self) -> &'a ir::Function {
        self.source
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn personality(&self) -> Option<&'a ir::Function> {
        self.personality
    }

    pub fn node(&self, id: NodeId) -> &InstructionNode {
        &self.nodes[id.index()]
    }

    pub fn node_for(&self, key: ValueKey) -> Option<NodeId> {
        self.lookup.get(&key).copied()
    }

    pub fn param(&self, id: ValueId) -> Option<&'a ir::Param> {
        let index = *self.params.get(&id)?;
        self.source.params.get(index as usize)
    }

    pub fn param_index(&self, id: ValueId) -> Option<u32> {
        self.params.get(&id).copied()
    }

    pub fn block_index(&self, id: BlockId) -> Option<usize> {
        self.block_index.get(&id).copied()
    }

    /// Node an operand refers to, if it is an instruction of this function.
    pub fn resolve(&self, operand: &OperandRef) -> Option<NodeId> {
        self.node_for(operand.key()?)
    }

    fn link_blocks(&mut self) -> Result<()> {
        for index in 0..self.blocks.len() {
            let Some(terminator) = self.blocks[index].terminator() else {
                defect!(
                    self.location,
                    StructuralDefect::InvalidOperand(format!(
                        "block {} is empty",
                        self.blocks[index].id
                    ))
                );
            };
            let node = &self.nodes[terminator.index()];
            if !node.opcode.is_terminator() {
                defect!(
                    self.location.at(node.key.value(), node.opcode),
                    StructuralDefect::InvalidOperand(format!(
                        "block {} does not end in a terminator",
                        self.blocks[index].id
                    ))
                );
            }
            let location = self.location.at(node.key.value(), node.opcode);
            for target in node.kind.successors() {
                let Some(&successor) = self.block_index.get(&target) else {
                    defect!(location, StructuralDefect::MissingBlock(target));
                };
                if self.blocks[index].add_successor(successor) {
                    self.blocks[successor].add_predecessor(index);
                }
            }
        }
        Ok(())
    }

    /// Single pass over every node recording load, store and accessor edges, and
    /// binding each phi's incoming values to the block's predecessors.
    fn analyze_data_flow(&mut self) -> Result<()> {
        let mut edges = Vec::new();
        let mut memory = Vec::new();
        let mut incoming = Vec::new();

        for (index, node) in self.nodes.iter().enumerate() {
            let consumer = NodeId(index as u32);
            match &node.kind {
                InstructionKind::Load { .. } => {
                    let source = self.resolve(&node.operands[0]);
                    if let Some(source) = source {
                        edges.push((source, Edge::Load, consumer));
                    }
                    memory.push((consumer, source));
                }
                InstructionKind::Store { .. } => {
                    if let Some(value) = self.resolve(&node.operands[0]) {
                        edges.push((value, Edge::Access, consumer));
                    }
                    let destination = self.resolve(&node.operands[1]);
                    if let Some(destination) = destination {
                        edges.push((destination, Edge::Store, consumer));
                    }
                    memory.push((consumer, destination));
                }
                InstructionKind::Phi { sources, .. } => {
                    let block = &self.blocks[node.block];
                    let mut values = Vec::with_capacity(block.predecessors.len());
                    for &predecessor in &block.predecessors {
                        let predecessor_id = self.blocks[predecessor].id;
                        let Some(position) = sources.iter().position(|s| *s == predecessor_id)
                        else {
                            defect!(
                                self.location.at(node.key.value(), node.opcode),
                                StructuralDefect::PhiMismatch(predecessor_id)
                            );
                        };
                        values.push((predecessor, node.operands[position].clone()));
                    }
                    for operand in &node.operands {
                        if let Some(value) = self.resolve(operand) {
                            edges.push((value, Edge::Access, consumer));
                        }
                    }
                    incoming.push((consumer, values));
                }
                _ => {
                    for operand in &node.operands {
                        if let Some(value) = self.resolve(operand) {
                            edges.push((value, Edge::Access, consumer));
                        }
                    }
                }
            }
        }

        for (producer, edge, consumer) in edges {
            let producer = &mut self.nodes[producer.index()];
            match edge {
                Edge::Load => producer.loads.insert(consumer),
                Edge::Store => producer.stores.insert(consumer),
                Edge::Access => producer.accessors.insert(consumer),
            };
        }
        for (id, address) in memory {
            match &mut self.nodes[id.index()].kind {
                InstructionKind::Load { source, .. } => *source = address,
                InstructionKind::Store { destination } => *destination = address,
                _ => {}
            }
        }
        for (id, values) in incoming {
            if let InstructionKind::Phi { incoming, .. } = &mut self.nodes[id.index()].kind {
                *incoming = values;
            }
        }
        trace!("{}: data-flow analysis complete", self.name);
        Ok(())
    }

    fn resolve_personality(&self, module: &ModuleContext<'a>) -> Result<Option<&'a ir::Function>> {
        let handles_exceptions = self
            .nodes
            .iter()
            .any(|node| node.kind.is_exception_construct());
        match &self.source.personality {
            Some(name) => match module.source().function(name) {
                Some(function) => Ok(Some(function)),
                None => defect!(
                    self.location,
                    StructuralDefect::UnknownPersonality(name.clone())
                ),
            },
            None if handles_exceptions => {
                defect!(self.location, StructuralDefect::MissingPersonality)
            }
            None => Ok(None),
        }
    }

    /// Whether `index` can stay on the evaluation stack for its only consumer.
    fn stays_on_stack(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        if node.accessors.len() != 1 || !node.loads.is_empty() || !node.stores.is_empty() {
            return false;
        }
        let Some(&consumer_id) = node.accessors.iter().next() else {
            return false;
        };
        let consumer = self.node(consumer_id);
        if consumer.block != node.block {
            return false;
        }
        let instructions = &self.blocks[node.block].instructions;
        let produced_at = instructions.iter().position(|id| id.index() == index);
        let follows = produced_at
            .and_then(|position| instructions.get(position + 1))
            .is_some_and(|next| *next == consumer_id);
        if !follows {
            return false;
        }
        let Some(first) = consumer.kind.first_evaluated_operand() else {
            return false;
        };
        let producer = NodeId(index as u32);
        let uses = consumer
            .operands
            .iter()
            .filter(|operand| self.resolve(operand) == Some(producer))
            .count();
        uses == 1
            && consumer
                .operands
                .get(first)
                .is_some_and(|operand| self.resolve(operand) == Some(producer))
    }

    fn local_type(&self, node: &InstructionNode, module: &ModuleContext<'a>) -> Result<TypeSig> {
        let location = self.location.at(node.key.value(), node.opcode);
        let ty = match (&node.kind, &node.result_type) {
            (InstructionKind::Alloca { allocated }, _) => allocated,
            (InstructionKind::GetElementPtr { target, .. }, _) => {
                let Some(pointee) = module.types().lookup(target) else {
                    defect!(location, StructuralDefect::UnregisteredType(target.to_string()));
                };
                return Ok(TypeSig::pointer_to(pointee.clone()));
            }
            (_, Some(result)) => result,
            (_, None) => return Ok(TypeSig::Void),
        };
        match module.types().lookup(ty) {
            Some(sig) => Ok(sig.clone()),
            None => defect!(location, StructuralDefect::UnregisteredType(ty.to_string())),
        }
    }

    fn allocate_slots(&mut self, body: &mut MethodBodyBuilder, module: &ModuleContext<'a>) -> Result<()> {
        let mut slots = Vec::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.iter().enumerate() {
            let slot = if node.result_type.is_none() {
                ResultSlot::None
            } else {
                match &node.kind {
                    InstructionKind::Alloca { .. } | InstructionKind::Phi { .. } => {
                        ResultSlot::Local(body.add_local(self.local_type(node, module)?))
                    }
                    InstructionKind::Select if node.is_used() => {
                        ResultSlot::Local(body.add_local(self.local_type(node, module)?))
                    }
                    _ if !node.is_used() => ResultSlot::None,
                    _ if self.stays_on_stack(index) => ResultSlot::Stack,
                    _ => ResultSlot::Local(body.add_local(self.local_type(node, module)?)),
                }
            };
            slots.push(slot);
        }
        for (node, slot) in self.nodes.iter_mut().zip(slots) {
            node.slot = slot;
        }
        trace!("{}: {} locals allocated", self.name, body.local_count());
        Ok(())
    }

    /// Lowers the whole body. Nothing is written to `output` except interned constants.
    pub fn lower(&mut self, module: &ModuleContext<'a>, output: &mut TargetModule) -> Result<MethodBody> {
        let mut body = MethodBodyBuilder::new();
        self.allocate_slots(&mut body, module)?;

        let context: &FunctionContext<'a> = self;
        let mut emitter = Emitter::new(module, context, output, body);
        for (index, block) in context.blocks.iter().enumerate() {
            emitter.begin_block(index);
            for id in &block.instructions {
                context.node(*id).lower(&mut emitter)?;
            }
            emitter.flush_trampolines()?;
        }
        let body = emitter.finish()?;
        debug!("lowered {} into {} ops", context.name, body.ops.len());
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TranslationOptions;
    use ib_ir::{FunctionType, ModuleBuilder, Opcode, Operand, Type};

    fn build(module: &ir::Module, check: impl FnOnce(&FunctionContext<'_>)) {
        let options = TranslationOptions::default();
        let context = ModuleContext::declare(module, &options).expect("declare");
        let entry = context.methods().first().expect("one method");
        let function = FunctionContext::create(entry, &context).expect("create");
        check(&function);
    }

    #[test]
    fn predecessor_and_successor_links_are_symmetric() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.function("f", FunctionType::new(Type::i32(), vec![Type::i32()]));
        f.append_block("entry");
        let left = f.append_block("left");
        let right = f.append_block("right");
        let join = f.append_block("join");
        let x = f.param(0);
        let cond = f.icmp(ir::predicate::ICMP_SGT, x.clone(), Operand::int(32, 0));
        f.cond_br(cond, left, right);
        f.position_at(left);
        f.br(join);
        f.position_at(right);
        f.switch(x.clone(), join, vec![(Operand::int(32, 1), join), (Operand::int(32, 2), join)]);
        f.position_at(join);
        let v = f.phi(Type::i32(), vec![(Operand::int(32, 1), left), (Operand::int(32, 2), right)]);
        f.ret(Some(v));
        f.finish();
        let module = builder.finish();

        build(&module, |function| {
            for (index, block) in function.blocks.iter().enumerate() {
                for successor in &block.successors {
                    assert!(function.blocks[*successor].predecessors.contains(&index));
                }
                for predecessor in &block.predecessors {
                    assert!(function.blocks[*predecessor].successors.contains(&index));
                }
            }
            // three switch edges into `join` collapse into one
            assert_eq!(function.blocks[2].successors, vec![3]);
            assert_eq!(function.blocks[3].predecessors.len(), 2);
        });
    }

    #[test]
    fn loads_and_stores_are_recorded_on_the_address() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.function("f", FunctionType::new(Type::i32(), vec![]));
        let slot = f.alloca(Type::i32());
        f.store(Operand::int(32, 7), slot.clone());
        let value = f.load(Type::i32(), slot);
        f.ret(Some(value));
        f.finish();
        let module = builder.finish();

        build(&module, |function| {
            let alloca = function.node(NodeId(0));
            assert_eq!(alloca.stores.len(), 1);
            assert_eq!(alloca.loads.len(), 1);
            assert!(alloca.accessors.is_empty());
            let load = function.node(NodeId(2));
            assert!(matches!(load.kind, InstructionKind::Load { source: Some(NodeId(0)), .. }));
            assert_eq!(load.accessors.len(), 1);
        });
    }

    #[test]
    fn constant_expressions_are_synthesized_before_their_consumer() {
        let mut builder = ModuleBuilder::new("m");
        let table = builder.add_global("table", Type::array(Type::i32(), 4), None);
        let mut f = builder.function("f", FunctionType::new(Type::i32(), vec![]));
        let address = Operand::expr(
            Opcode::GetElementPtr,
            Type::Pointer,
            vec![table, Operand::int(64, 0), Operand::int(64, 2)],
            ir::InstrInfo::Gep {
                source_element: Type::array(Type::i32(), 4),
                inbounds: true,
            },
        );
        let value = f.load(Type::i32(), address);
        f.ret(Some(value));
        f.finish();
        let module = builder.finish();

        build(&module, |function| {
            let block = &function.blocks[0];
            assert_eq!(block.instructions.len(), 3);
            let synthesized = function.node(block.instructions[0]);
            assert_eq!(synthesized.key, ValueKey::Synthesized(0));
            assert_eq!(synthesized.block, 0);
            assert_eq!(synthesized.accessors.len(), 0);
            assert_eq!(synthesized.loads.len(), 1);
        });
    }

    /// Every operand that names a node is recorded on that node, and every recorded
    /// edge comes from such an operand.
    fn assert_reciprocal(function: &FunctionContext<'_>) {
        let mut expected = 0;
        for (index, node) in function.nodes.iter().enumerate() {
            let consumer = NodeId(index as u32);
            for (position, operand) in node.operands.iter().enumerate() {
                let Some(producer) = function.resolve(operand) else {
                    continue;
                };
                let producer = function.node(producer);
                let recorded = match (&node.kind, position) {
                    (InstructionKind::Load { .. }, 0) => &producer.loads,
                    (InstructionKind::Store { .. }, 1) => &producer.stores,
                    _ => &producer.accessors,
                };
                assert!(recorded.contains(&consumer), "edge {:?} -> {:?}", producer.key, node.key);
                expected += 1;
            }
        }
        let recorded: usize = function
            .nodes
            .iter()
            .map(|node| node.loads.len() + node.stores.len() + node.accessors.len())
            .sum();
        assert_eq!(recorded, expected);
    }

    #[test]
    fn data_flow_edges_are_recorded_on_both_ends() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.function("f", FunctionType::new(Type::i32(), vec![Type::i32(), Type::i1()]));
        f.append_block("entry");
        let left = f.append_block("left");
        let right = f.append_block("right");
        let join = f.append_block("join");
        let (x, c) = (f.param(0), f.param(1));
        let slot = f.alloca(Type::i32());
        let doubled = f.binary(Opcode::Add, Type::i32(), x.clone(), x.clone());
        f.store(doubled.clone(), slot.clone());
        f.cond_br(c, left, right);
        f.position_at(left);
        let loaded = f.load(Type::i32(), slot);
        let bumped = f.binary(Opcode::Add, Type::i32(), loaded.clone(), Operand::int(32, 1));
        f.br(join);
        f.position_at(right);
        let negated = f.binary(Opcode::Sub, Type::i32(), Operand::int(32, 0), x);
        f.br(join);
        f.position_at(join);
        let merged = f.phi(Type::i32(), vec![(bumped, left), (negated, right)]);
        f.ret(Some(merged));
        f.finish();
        let module = builder.finish();

        build(&module, |function| {
            assert_reciprocal(function);
            let id = |operand: &Operand| {
                function
                    .node_for(ValueKey::Value(operand.as_value().expect("value")))
                    .expect("node")
            };
            let store = function.blocks[0].instructions[2];
            assert!(function.node(id(&doubled)).accessors.contains(&store));
            let phi = function.blocks[3].instructions[0];
            assert!(matches!(function.node(phi).kind, InstructionKind::Phi { .. }));
            assert_eq!(function.node(phi).accessors.len(), 1);
            let bumped = function.blocks[1].instructions[1];
            let negated = function.blocks[2].instructions[0];
            assert_eq!(function.node(bumped).accessors.iter().collect::<Vec<_>>(), vec![&phi]);
            assert_eq!(function.node(negated).accessors.iter().collect::<Vec<_>>(), vec![&phi]);
            assert!(function.node(id(&loaded)).accessors.contains(&bumped));
        });
    }

    #[test]
    fn phi_constant_expressions_move_to_the_incoming_block() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.function("f", FunctionType::new(Type::i32(), vec![Type::i1()]));
        let entry = f.append_block("entry");
        let left = f.append_block("left");
        let join = f.append_block("join");
        let c = f.param(0);
        f.cond_br(c, left, join);
        f.position_at(left);
        f.br(join);
        f.position_at(join);
        let answer = Operand::expr(
            Opcode::Add,
            Type::i32(),
            vec![Operand::int(32, 40), Operand::int(32, 2)],
            ir::InstrInfo::None,
        );
        let v = f.phi(Type::i32(), vec![(answer, left), (Operand::int(32, 0), entry)]);
        f.ret(Some(v));
        f.finish();
        let module = builder.finish();

        build(&module, |function| {
            let left = &function.blocks[1];
            assert_eq!(left.instructions.len(), 2);
            let synthesized = function.node(left.instructions[0]);
            assert_eq!(synthesized.key, ValueKey::Synthesized(0));
            assert_eq!(synthesized.block, 1);
            let join = &function.blocks[2];
            assert!(matches!(
                function.node(join.instructions[0]).kind,
                InstructionKind::Phi { .. }
            ));
            assert_reciprocal(function);
        });
    }

    #[test]
    fn phi_without_value_for_a_predecessor_is_a_defect() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.function("f", FunctionType::new(Type::i32(), vec![Type::i1()]));
        let entry = f.append_block("entry");
        let other = f.append_block("other");
        let join = f.append_block("join");
        let c = f.param(0);
        f.cond_br(c, other, join);
        f.position_at(other);
        f.br(join);
        f.position_at(join);
        let v = f.phi(Type::i32(), vec![(Operand::int(32, 1), other)]);
        f.ret(Some(v));
        f.finish();
        let module = builder.finish();

        let options = TranslationOptions::default();
        let context = ModuleContext::declare(&module, &options).expect("declare");
        let err = FunctionContext::create(&context.methods()[0], &context).unwrap_err();
        assert_eq!(err.defect(), Some(&StructuralDefect::PhiMismatch(entry)));
    }
}
