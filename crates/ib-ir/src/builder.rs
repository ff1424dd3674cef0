use crate::instruction::{InstrInfo, Instruction};
use crate::module::{Attribute, Block, Function, Global, Module, Param, StructType};
use crate::opcode::Opcode;
use crate::ty::{FunctionType, Type};
use crate::value::{BlockId, Constant, Operand, ValueId};

/// Assembles a [`Module`] while handing out module-unique value and block identities.
pub struct ModuleBuilder {
    module: Module,
    next_value: u32,
    next_block: u32,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module: Module::new(name),
            next_value: 0,
            next_block: 0,
        }
    }

    fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    fn fresh_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        id
    }

    pub fn add_struct(&mut self, name: impl Into<String>, fields: Vec<Type>) -> Type {
        self.push_struct(name.into(), fields, false)
    }

    pub fn add_packed_struct(&mut self, name: impl Into<String>, fields: Vec<Type>) -> Type {
        self.push_struct(name.into(), fields, true)
    }

    fn push_struct(&mut self, name: String, fields: Vec<Type>, packed: bool) -> Type {
        self.module.structs.push(StructType {
            name: name.clone(),
            fields,
            packed,
        });
        Type::Struct(name)
    }

    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        initializer: Option<Vec<u8>>,
    ) -> Operand {
        let name = name.into();
        self.module.globals.push(Global {
            name: name.clone(),
            ty,
            initializer,
            constant: false,
        });
        Operand::Global(name)
    }

    /// Adds a body-less function. Calls to it are resolved against the runtime table.
    pub fn declare_function(&mut self, name: impl Into<String>, ty: FunctionType) -> Operand {
        let function = self.new_function(name.into(), ty);
        let callee = Operand::Function(function.name.clone());
        self.module.functions.push(function);
        callee
    }

    pub fn function(&mut self, name: impl Into<String>, ty: FunctionType) -> FunctionBuilder<'_> {
        let function = self.new_function(name.into(), ty);
        FunctionBuilder {
            owner: self,
            function,
            current: None,
        }
    }

    fn new_function(&mut self, name: String, ty: FunctionType) -> Function {
        let params = ty
            .params
            .iter()
            .map(|param_ty| Param {
                id: self.fresh_value(),
                name: None,
                ty: param_ty.clone(),
                attributes: Vec::new(),
            })
            .collect();
        Function {
            name,
            demangled_name: None,
            ty,
            params,
            attributes: Vec::new(),
            return_attributes: Vec::new(),
            personality: None,
            blocks: Vec::new(),
        }
    }

    pub fn finish(self) -> Module {
        self.module
    }
}

pub struct FunctionBuilder<'m> {
    owner: &'m mut ModuleBuilder,
    function: Function,
    current: Option<usize>,
}

impl<'m> FunctionBuilder<'m> {
    pub fn param(&self, index: usize) -> Operand {
        match self.function.params.get(index) {
            Some(param) => Operand::Value(param.id),
            None => Operand::Const(Constant::Undef(Type::Void)),
        }
    }

    pub fn param_attribute(&mut self, index: usize, attribute: Attribute) -> &mut Self {
        if let Some(param) = self.function.params.get_mut(index) {
            param.attributes.push(attribute);
        }
        self
    }

    pub fn attribute(&mut self, attribute: Attribute) -> &mut Self {
        self.function.attributes.push(attribute);
        self
    }

    pub fn demangled(&mut self, name: impl Into<String>) -> &mut Self {
        self.function.demangled_name = Some(name.into());
        self
    }

    pub fn personality(&mut self, name: impl Into<String>) -> &mut Self {
        self.function.personality = Some(name.into());
        self
    }

    /// Appends a block; the first block appended becomes the insertion point.
    pub fn append_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.owner.fresh_block();
        self.function.blocks.push(Block {
            id,
            name: Some(name.into()),
            instructions: Vec::new(),
        });
        if self.current.is_none() {
            self.current = Some(self.function.blocks.len() - 1);
        }
        id
    }

    pub fn position_at(&mut self, block: BlockId) -> &mut Self {
        if let Some(index) = self.function.blocks.iter().position(|b| b.id == block) {
            self.current = Some(index);
        }
        self
    }

    pub fn push(
        &mut self,
        opcode: Opcode,
        ty: Type,
        operands: Vec<Operand>,
        info: InstrInfo,
    ) -> Operand {
        let id = self.owner.fresh_value();
        let index = match self.current {
            Some(index) => index,
            None => {
                self.append_block("entry");
                self.function.blocks.len() - 1
            }
        };
        self.function.blocks[index]
            .instructions
            .push(Instruction::new(id, opcode, ty, operands).with_info(info));
        Operand::Value(id)
    }

    pub fn binary(&mut self, opcode: Opcode, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        self.push(opcode, ty, vec![lhs, rhs], InstrInfo::None)
    }

    pub fn fneg(&mut self, ty: Type, value: Operand) -> Operand {
        self.push(Opcode::FNeg, ty, vec![value], InstrInfo::None)
    }

    pub fn icmp(&mut self, predicate: u32, lhs: Operand, rhs: Operand) -> Operand {
        self.push(
            Opcode::ICmp,
            Type::i1(),
            vec![lhs, rhs],
            InstrInfo::Predicate(predicate),
        )
    }

    pub fn fcmp(&mut self, predicate: u32, lhs: Operand, rhs: Operand) -> Operand {
        self.push(
            Opcode::FCmp,
            Type::i1(),
            vec![lhs, rhs],
            InstrInfo::Predicate(predicate),
        )
    }

    pub fn cast(&mut self, opcode: Opcode, value: Operand, to: Type) -> Operand {
        self.push(opcode, to, vec![value], InstrInfo::None)
    }

    pub fn alloca(&mut self, allocated: Type) -> Operand {
        self.push(
            Opcode::Alloca,
            Type::Pointer,
            Vec::new(),
            InstrInfo::Alloca { allocated },
        )
    }

    pub fn load(&mut self, ty: Type, address: Operand) -> Operand {
        self.push(Opcode::Load, ty, vec![address], InstrInfo::None)
    }

    pub fn store(&mut self, value: Operand, address: Operand) {
        self.push(Opcode::Store, Type::Void, vec![value, address], InstrInfo::None);
    }

    pub fn gep(&mut self, source_element: Type, base: Operand, indices: Vec<Operand>) -> Operand {
        let mut operands = vec![base];
        operands.extend(indices);
        self.push(
            Opcode::GetElementPtr,
            Type::Pointer,
            operands,
            InstrInfo::Gep {
                source_element,
                inbounds: true,
            },
        )
    }

    pub fn call(&mut self, function_type: FunctionType, callee: Operand, args: Vec<Operand>) -> Operand {
        let ret = (*function_type.ret).clone();
        let mut operands = args;
        operands.push(callee);
        self.push(Opcode::Call, ret, operands, InstrInfo::Call { function_type })
    }

    pub fn invoke(
        &mut self,
        function_type: FunctionType,
        callee: Operand,
        args: Vec<Operand>,
        normal: BlockId,
        unwind: BlockId,
    ) -> Operand {
        let ret = (*function_type.ret).clone();
        let mut operands = args;
        operands.push(Operand::Block(normal));
        operands.push(Operand::Block(unwind));
        operands.push(callee);
        self.push(Opcode::Invoke, ret, operands, InstrInfo::Call { function_type })
    }

    pub fn select(&mut self, ty: Type, cond: Operand, then: Operand, otherwise: Operand) -> Operand {
        self.push(Opcode::Select, ty, vec![cond, then, otherwise], InstrInfo::None)
    }

    pub fn va_arg(&mut self, ty: Type, list: Operand) -> Operand {
        self.push(Opcode::VAArg, ty, vec![list], InstrInfo::None)
    }

    pub fn freeze(&mut self, ty: Type, value: Operand) -> Operand {
        self.push(Opcode::Freeze, ty, vec![value], InstrInfo::None)
    }

    pub fn phi(&mut self, ty: Type, incoming: Vec<(Operand, BlockId)>) -> Operand {
        let (values, blocks): (Vec<_>, Vec<_>) = incoming.into_iter().unzip();
        self.push(
            Opcode::Phi,
            ty,
            values,
            InstrInfo::Phi {
                incoming_blocks: blocks,
            },
        )
    }

    /// Adds an incoming edge to a phi created earlier, for loop back-edges.
    pub fn add_incoming(&mut self, phi: &Operand, value: Operand, block: BlockId) {
        let Some(id) = phi.as_value() else {
            return;
        };
        let found = self
            .function
            .blocks
            .iter_mut()
            .flat_map(|b| b.instructions.iter_mut())
            .find(|inst| inst.id == id);
        if let Some(inst) = found {
            if let InstrInfo::Phi { incoming_blocks } = &mut inst.info {
                incoming_blocks.push(block);
                inst.operands.push(value);
            }
        }
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(Opcode::Br, Type::Void, vec![Operand::Block(target)], InstrInfo::None);
    }

    pub fn cond_br(&mut self, cond: Operand, then: BlockId, otherwise: BlockId) {
        self.push(
            Opcode::Br,
            Type::Void,
            vec![cond, Operand::Block(then), Operand::Block(otherwise)],
            InstrInfo::None,
        );
    }

    pub fn switch(&mut self, value: Operand, default: BlockId, cases: Vec<(Operand, BlockId)>) {
        let mut operands = vec![value, Operand::Block(default)];
        for (case, target) in cases {
            operands.push(case);
            operands.push(Operand::Block(target));
        }
        self.push(Opcode::Switch, Type::Void, operands, InstrInfo::None);
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(
            Opcode::Ret,
            Type::Void,
            value.into_iter().collect(),
            InstrInfo::None,
        );
    }

    pub fn unreachable(&mut self) {
        self.push(Opcode::Unreachable, Type::Void, Vec::new(), InstrInfo::None);
    }

    pub fn catch_switch(&mut self, handlers: Vec<BlockId>, unwind: Option<BlockId>) -> Operand {
        let mut operands = vec![Operand::Const(Constant::NoneToken)];
        operands.extend(handlers.into_iter().map(Operand::Block));
        operands.extend(unwind.map(Operand::Block));
        self.push(Opcode::CatchSwitch, Type::Token, operands, InstrInfo::None)
    }

    pub fn catch_pad(&mut self, within: Operand, args: Vec<Operand>) -> Operand {
        let mut operands = vec![within];
        operands.extend(args);
        self.push(Opcode::CatchPad, Type::Token, operands, InstrInfo::None)
    }

    pub fn catch_ret(&mut self, pad: Operand, target: BlockId) {
        self.push(
            Opcode::CatchRet,
            Type::Void,
            vec![pad, Operand::Block(target)],
            InstrInfo::None,
        );
    }

    pub fn cleanup_pad(&mut self, args: Vec<Operand>) -> Operand {
        let mut operands = vec![Operand::Const(Constant::NoneToken)];
        operands.extend(args);
        self.push(Opcode::CleanupPad, Type::Token, operands, InstrInfo::None)
    }

    pub fn cleanup_ret(&mut self, pad: Operand, unwind: Option<BlockId>) {
        let mut operands = vec![pad];
        operands.extend(unwind.map(Operand::Block));
        self.push(Opcode::CleanupRet, Type::Void, operands, InstrInfo::None);
    }

    pub fn landing_pad(&mut self) -> Operand {
        self.push(Opcode::LandingPad, Type::Token, Vec::new(), InstrInfo::None)
    }

    pub fn resume(&mut self, value: Operand) {
        self.push(Opcode::Resume, Type::Void, vec![value], InstrInfo::None);
    }

    pub fn finish(self) -> Operand {
        let callee = Operand::Function(self.function.name.clone());
        self.owner.module.functions.push(self.function);
        callee
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_module_unique() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.function("f", FunctionType::new(Type::i32(), vec![Type::i32()]));
        let a = f.param(0);
        let entry = f.append_block("entry");
        let sum = f.binary(Opcode::Add, Type::i32(), a.clone(), a);
        f.ret(Some(sum.clone()));
        f.finish();

        let mut g = builder.function("g", FunctionType::new(Type::Void, vec![]));
        let other = g.append_block("entry");
        g.ret(None);
        g.finish();

        let module = builder.finish();
        assert_ne!(entry, other);
        assert_eq!(module.functions.len(), 2);
        assert_eq!(module.functions[0].params[0].id, ValueId(0));
        assert_eq!(sum.as_value(), Some(ValueId(1)));
    }

    #[test]
    fn phi_incoming_can_be_added_later() {
        let mut builder = ModuleBuilder::new("m");
        let mut f = builder.function("loop", FunctionType::new(Type::Void, vec![]));
        let entry = f.append_block("entry");
        let body = f.append_block("body");
        f.br(body);
        f.position_at(body);
        let counter = f.phi(Type::i32(), vec![(Operand::int(32, 0), entry)]);
        let next = f.binary(Opcode::Add, Type::i32(), counter.clone(), Operand::int(32, 1));
        f.add_incoming(&counter, next, body);
        f.br(body);
        f.finish();

        let module = builder.finish();
        let phi = &module.functions[0].blocks[1].instructions[0];
        assert_eq!(phi.operands.len(), 2);
        assert_eq!(
            phi.info,
            InstrInfo::Phi {
                incoming_blocks: vec![entry, body]
            }
        );
    }
}
