//! Shared fixtures for ib-translate scenario tests.

#![allow(dead_code)]

use eyre::Result;
use ib_bytecode::{MethodDef, Op, TargetModule, Visibility};
use ib_ir::{FunctionType, Module, ModuleBuilder, Opcode, Operand, Type};
use ib_translate::{translate_module, TranslationOptions};
use ib_vm::{Value, Vm, VmError};

pub const PERSONALITY: &str = "__CxxFrameHandler3";

pub fn translate(module: &Module) -> Result<TargetModule> {
    Ok(translate_module(module, &TranslationOptions::default())?)
}

pub fn method<'m>(module: &'m TargetModule, name: &str) -> &'m MethodDef {
    match module.method(name) {
        Some(method) => method,
        None => panic!("no method named {}", name),
    }
}

/// Ops of a method without the label markers.
pub fn ops(module: &TargetModule, name: &str) -> Vec<Op> {
    method(module, name)
        .body
        .ops
        .iter()
        .filter(|op| !matches!(op, Op::Label(_)))
        .cloned()
        .collect()
}

pub fn public_index(module: &TargetModule, name: &str) -> u32 {
    let index = module
        .methods
        .iter()
        .position(|method| method.name == name && method.visibility == Visibility::Public);
    match index {
        Some(index) => index as u32,
        None => panic!("no public method named {}", name),
    }
}

pub fn run(module: &Module, name: &str, args: Vec<Value>) -> Result<Option<Value>> {
    let target = translate(module)?;
    let mut vm = Vm::new(target);
    Ok(vm.run(name, args)?)
}

/// Runs `name` and also hands back everything the program printed.
pub fn run_with_output(
    module: &Module,
    name: &str,
    args: Vec<Value>,
) -> Result<(std::result::Result<Option<Value>, VmError>, String)> {
    let target = translate(module)?;
    let mut vm = Vm::new(target);
    let result = vm.run(name, args);
    Ok((result, vm.output().to_string()))
}

/// `i32 add(i32 a, i32 b) { return a + b; }`
pub fn add_module() -> Module {
    let mut builder = ModuleBuilder::new("add");
    let mut f = builder.function("add", FunctionType::new(Type::i32(), vec![Type::i32(), Type::i32()]));
    f.append_block("entry");
    let (a, b) = (f.param(0), f.param(1));
    let sum = f.binary(Opcode::Add, Type::i32(), a, b);
    f.ret(Some(sum));
    f.finish();
    builder.finish()
}

/// `i32 pick(i1 c) { return c ? 1 : 2; }` written as a diamond with a phi.
pub fn diamond_module() -> Module {
    let mut builder = ModuleBuilder::new("diamond");
    let mut f = builder.function("pick", FunctionType::new(Type::i32(), vec![Type::i1()]));
    f.append_block("entry");
    let then = f.append_block("then");
    let otherwise = f.append_block("else");
    let join = f.append_block("join");
    let c = f.param(0);
    f.cond_br(c, then, otherwise);
    f.position_at(then);
    f.br(join);
    f.position_at(otherwise);
    f.br(join);
    f.position_at(join);
    let v = f.phi(
        Type::i32(),
        vec![(Operand::int(32, 1), then), (Operand::int(32, 2), otherwise)],
    );
    f.ret(Some(v));
    f.finish();
    builder.finish()
}

/// Module with one `i1 cmp(double, double)` per float predicate code, named `cmp<code>`.
pub fn float_compare_module(predicates: impl IntoIterator<Item = u32>) -> Module {
    let mut builder = ModuleBuilder::new("fcmp");
    for code in predicates {
        let mut f = builder.function(
            format!("cmp{}", code),
            FunctionType::new(Type::i1(), vec![Type::Double, Type::Double]),
        );
        f.append_block("entry");
        let (a, b) = (f.param(0), f.param(1));
        let result = f.fcmp(code, a, b);
        f.ret(Some(result));
        f.finish();
    }
    builder.finish()
}
