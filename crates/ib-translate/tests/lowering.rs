mod support;

use eyre::Result;
use ib_bytecode::{
    BinaryOp, IntWidth, NumKind, Op, RecordId, RuntimeEntry, TypeSig, Visibility,
};
use ib_ir::{
    predicate, Attribute, FunctionType, InstrInfo, ModuleBuilder, Opcode, Operand, Type,
};
use ib_translate::instruction::InstructionKind;
use ib_translate::{
    translate_module, FunctionContext, ModuleContext, StructuralDefect, TranslateError,
    TranslationOptions,
};
use pretty_assertions::assert_eq;
use support::{add_module, diamond_module, method, ops, translate, PERSONALITY};

fn record_id(module: &ib_bytecode::TargetModule, name: &str) -> RecordId {
    match module.records.iter().position(|record| record.name == name) {
        Some(index) => RecordId(index as u32),
        None => panic!("no record named {}", name),
    }
}

#[test]
fn single_use_sum_stays_on_the_stack() -> Result<()> {
    let module = translate(&add_module())?;
    assert_eq!(
        ops(&module, "add"),
        vec![
            Op::LoadArg(0),
            Op::LoadArg(1),
            Op::Binary {
                op: BinaryOp::Add,
                kind: NumKind::Int(IntWidth::I32),
            },
            Op::Return,
        ]
    );
    assert!(method(&module, "add").body.locals.is_empty());
    Ok(())
}

#[test]
fn reused_sum_gets_exactly_one_local() -> Result<()> {
    let mut builder = ModuleBuilder::new("twice");
    let mut f = builder.function("twice", FunctionType::new(Type::i32(), vec![Type::i32(), Type::i32()]));
    let (a, b) = (f.param(0), f.param(1));
    let sum = f.binary(Opcode::Add, Type::i32(), a, b);
    let doubled = f.binary(Opcode::Add, Type::i32(), sum.clone(), sum);
    f.ret(Some(doubled));
    f.finish();

    let module = translate(&builder.finish())?;
    let add = Op::Binary {
        op: BinaryOp::Add,
        kind: NumKind::Int(IntWidth::I32),
    };
    assert_eq!(
        ops(&module, "twice"),
        vec![
            Op::LoadArg(0),
            Op::LoadArg(1),
            add.clone(),
            Op::StoreLocal(0),
            Op::LoadLocal(0),
            Op::LoadLocal(0),
            add,
            Op::Return,
        ]
    );
    assert_eq!(
        method(&module, "twice").body.locals,
        vec![TypeSig::Int(IntWidth::I32)]
    );
    Ok(())
}

#[test]
fn diamond_phi_binds_one_value_per_predecessor() -> Result<()> {
    let source = diamond_module();
    let options = TranslationOptions::default();
    let context = ModuleContext::declare(&source, &options)?;
    let function = FunctionContext::create(&context.methods()[0], &context)?;

    let phi = function
        .nodes
        .iter()
        .find_map(|node| match &node.kind {
            InstructionKind::Phi { incoming, .. } => Some(incoming.clone()),
            _ => None,
        })
        .unwrap_or_default();
    let mut predecessors: Vec<usize> = phi.iter().map(|(block, _)| *block).collect();
    predecessors.sort();
    assert_eq!(predecessors, vec![1, 2]);
    assert_eq!(function.blocks[3].predecessors.len(), 2);

    let module = translate(&source)?;
    // only the phi owns a local
    assert_eq!(method(&module, "pick").body.locals, vec![TypeSig::Int(IntWidth::I32)]);
    Ok(())
}

#[test]
fn nested_field_chain_resolves_to_the_innermost_field() -> Result<()> {
    let mut builder = ModuleBuilder::new("nested");
    let inner = builder.add_struct("struct.Inner", vec![Type::i64(), Type::i32()]);
    let outer = builder.add_struct("struct.Outer", vec![Type::i32(), inner]);
    let mut f = builder.function("get", FunctionType::new(Type::i64(), vec![]));
    let object = f.alloca(outer.clone());
    let field = f.gep(
        outer,
        object,
        vec![Operand::int(32, 0), Operand::int(32, 1), Operand::int(32, 0)],
    );
    f.store(Operand::int(64, 42), field.clone());
    let value = f.load(Type::i64(), field);
    f.ret(Some(value));
    f.finish();
    let source = builder.finish();

    let options = TranslationOptions::default();
    let context = ModuleContext::declare(&source, &options)?;
    let function = FunctionContext::create(&context.methods()[0], &context)?;
    let target = function.nodes.iter().find_map(|node| match &node.kind {
        InstructionKind::GetElementPtr { target, .. } => Some(target.clone()),
        _ => None,
    });
    assert_eq!(target, Some(Type::i64()));

    let module = translate(&source)?;
    let fields: Vec<Op> = ops(&module, "get")
        .into_iter()
        .filter(|op| matches!(op, Op::FieldAddress { .. }))
        .collect();
    assert_eq!(
        fields,
        vec![
            Op::FieldAddress {
                record: record_id(&module, "Outer"),
                field: 1,
            },
            Op::FieldAddress {
                record: record_id(&module, "Inner"),
                field: 0,
            },
        ]
    );
    Ok(())
}

#[test]
fn non_constant_field_index_is_rejected() {
    let mut builder = ModuleBuilder::new("nested");
    let outer = builder.add_struct("struct.Outer", vec![Type::i32(), Type::i32()]);
    let mut f = builder.function("pick", FunctionType::new(Type::Void, vec![Type::i32()]));
    let index = f.param(0);
    let object = f.alloca(outer.clone());
    let field = f.gep(outer, object, vec![Operand::int(32, 0), index]);
    f.store(Operand::int(32, 1), field);
    f.ret(None);
    f.finish();

    let err = translate_module(&builder.finish(), &TranslationOptions::default()).unwrap_err();
    assert_eq!(
        err.defect(),
        Some(&StructuralDefect::NonConstantFieldIndex {
            aggregate: "Outer".to_string(),
        })
    );
}

#[test]
fn aggregate_names_are_cleaned_and_unique() -> Result<()> {
    let mut builder = ModuleBuilder::new("names");
    let foo = builder.add_struct("class.Foo", vec![Type::i32()]);
    let bar = builder.add_struct("struct.Bar", vec![Type::i32()]);
    let other_foo = builder.add_struct("struct.Foo", vec![Type::i64()]);
    let mut f = builder.function("touch", FunctionType::new(Type::Void, vec![]));
    f.alloca(foo);
    f.alloca(bar);
    f.alloca(other_foo);
    f.ret(None);
    f.finish();

    let module = translate(&builder.finish())?;
    let names: Vec<&str> = module.records.iter().map(|record| record.name.as_str()).collect();
    assert_eq!(names, vec!["Foo", "Bar", "Foo_1"]);
    assert_eq!(module.records[0].fields[0].name, "field_0");
    Ok(())
}

#[test]
fn renamed_symbols_override_display_names() -> Result<()> {
    let mut builder = ModuleBuilder::new("rename");
    let mut f = builder.function("?helper@@YAHH@Z", FunctionType::new(Type::i32(), vec![Type::i32()]));
    let x = f.param(0);
    f.ret(Some(x));
    f.finish();
    let mut g = builder.function("?other@@YAHXZ", FunctionType::new(Type::i32(), vec![]));
    g.ret(Some(Operand::int(32, 0)));
    g.finish();
    let source = builder.finish();

    let options = TranslationOptions::default().rename("?helper@@YAHH@Z", "Helper");
    let module = translate_module(&source, &options)?;
    let names: Vec<&str> = module.methods.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["Helper", "other"]);
    assert_eq!(module.methods[0].mangled_name, "?helper@@YAHH@Z");
    Ok(())
}

#[test]
fn invalid_options_fail_before_translation() {
    let options = TranslationOptions {
        module_name: "not a name".to_string(),
        ..TranslationOptions::default()
    };
    let err = translate_module(&add_module(), &options).unwrap_err();
    assert!(matches!(err, TranslateError::Config(_)));

    let err = TranslationOptions::from_toml_str("max_constant_expression_nodes = 0").unwrap_err();
    assert!(matches!(err, TranslateError::Config(_)));
}

#[test]
fn unmapped_callee_is_an_unresolved_symbol() {
    let mut builder = ModuleBuilder::new("printf");
    let printf = builder.declare_function(
        "printf",
        FunctionType::variadic(Type::i32(), vec![Type::Pointer]),
    );
    let mut main = builder.function("main", FunctionType::new(Type::i32(), vec![]));
    main.call(
        FunctionType::variadic(Type::i32(), vec![Type::Pointer]),
        printf,
        vec![Operand::null()],
    );
    main.ret(Some(Operand::int(32, 0)));
    main.finish();

    let err = translate_module(&builder.finish(), &TranslationOptions::default()).unwrap_err();
    match err {
        TranslateError::UnresolvedSymbol { location, symbol } => {
            assert_eq!(symbol, "printf");
            assert_eq!(location.function, "main");
            assert_eq!(location.opcode, Some(Opcode::Call));
        }
        other => panic!("expected an unresolved symbol, got {}", other),
    }
}

#[test]
fn memory_intrinsics_drop_the_volatile_flag() -> Result<()> {
    let mut builder = ModuleBuilder::new("copy");
    let memcpy_type = FunctionType::new(
        Type::Void,
        vec![Type::Pointer, Type::Pointer, Type::i64(), Type::i1()],
    );
    let memcpy = builder.declare_function("llvm.memcpy.p0.p0.i64", memcpy_type.clone());
    let mut f = builder.function("copy", FunctionType::new(Type::Void, vec![Type::Pointer, Type::Pointer]));
    let (to, from) = (f.param(0), f.param(1));
    f.call(memcpy_type, memcpy, vec![to, from, Operand::int(64, 16), Operand::bool(false)]);
    f.ret(None);
    f.finish();

    let module = translate(&builder.finish())?;
    let calls: Vec<Op> = ops(&module, "copy")
        .into_iter()
        .filter(|op| matches!(op, Op::CallRuntime { .. }))
        .collect();
    assert_eq!(
        calls,
        vec![Op::CallRuntime {
            entry: RuntimeEntry::MemCopy,
            arg_count: 3,
        }]
    );
    Ok(())
}

#[test]
fn constant_expression_flattening_is_capped() -> Result<()> {
    let mut builder = ModuleBuilder::new("cap");
    let table = builder.add_global("table", Type::array(Type::i32(), 4), None);
    let mut f = builder.function("third", FunctionType::new(Type::i32(), vec![]));
    let gep = |base: Operand, index: i64| {
        Operand::expr(
            Opcode::GetElementPtr,
            Type::Pointer,
            vec![base, Operand::int(64, index)],
            InstrInfo::Gep {
                source_element: Type::i32(),
                inbounds: true,
            },
        )
    };
    let address = gep(gep(table, 1), 2);
    let value = f.load(Type::i32(), address);
    f.ret(Some(value));
    f.finish();
    let source = builder.finish();

    let tight = TranslationOptions {
        max_constant_expression_nodes: 1,
        ..TranslationOptions::default()
    };
    let err = translate_module(&source, &tight).unwrap_err();
    assert_eq!(err.defect(), Some(&StructuralDefect::ConstantExpressionLimit(1)));

    let roomy = TranslationOptions {
        max_constant_expression_nodes: 2,
        ..TranslationOptions::default()
    };
    translate_module(&source, &roomy)?;
    Ok(())
}

#[test]
fn struct_return_function_gets_a_public_wrapper() -> Result<()> {
    let mut builder = ModuleBuilder::new("sret");
    let pair = builder.add_struct("struct.Pair", vec![Type::i32(), Type::i32()]);
    let mut f = builder.function("make", FunctionType::new(Type::Void, vec![Type::Pointer, Type::i32()]));
    f.param_attribute(0, Attribute::StructRet(pair.clone()));
    let (result, x) = (f.param(0), f.param(1));
    let first = f.gep(pair, result, vec![Operand::int(32, 0), Operand::int(32, 0)]);
    f.store(x, first);
    f.ret(None);
    f.finish();

    let module = translate(&builder.finish())?;
    assert_eq!(module.methods.len(), 2);
    let internal = &module.methods[0];
    let wrapper = &module.methods[1];
    assert_eq!(internal.visibility, Visibility::Internal);
    assert_eq!(wrapper.visibility, Visibility::Public);
    assert_eq!(wrapper.name, internal.name);
    assert_eq!(wrapper.signature.ret, TypeSig::Record(RecordId(0)));
    assert_eq!(wrapper.signature.params, vec![TypeSig::Int(IntWidth::I32)]);
    assert_eq!(internal.parameter_names, vec!["result", "arg1"]);
    assert_eq!(
        wrapper.body.ops,
        vec![
            Op::InitLocal(0),
            Op::LoadLocalAddress(0),
            Op::LoadArg(0),
            Op::Call {
                method: 0,
                arg_count: 2,
            },
            Op::LoadLocal(0),
            Op::Return,
        ]
    );

    let options = TranslationOptions {
        emit_public_wrappers: false,
        ..TranslationOptions::default()
    };
    let mut builder = ModuleBuilder::new("sret");
    let pair = builder.add_struct("struct.Pair", vec![Type::i32()]);
    let mut f = builder.function("make", FunctionType::new(Type::Void, vec![Type::Pointer]));
    f.param_attribute(0, Attribute::StructRet(pair));
    f.ret(None);
    f.finish();
    let module = translate_module(&builder.finish(), &options)?;
    assert_eq!(module.methods.len(), 1);
    assert_eq!(module.methods[0].visibility, Visibility::Public);
    Ok(())
}

#[test]
fn invoke_of_a_non_throwing_callee_is_a_plain_call() -> Result<()> {
    let mut builder = ModuleBuilder::new("eh");
    builder.declare_function(PERSONALITY, FunctionType::variadic(Type::i32(), vec![]));
    let mut quiet = builder.function("quiet", FunctionType::new(Type::i32(), vec![]));
    quiet.ret(Some(Operand::int(32, 3)));
    let quiet = quiet.finish();

    let mut main = builder.function("main", FunctionType::new(Type::i32(), vec![]));
    main.personality(PERSONALITY);
    main.append_block("entry");
    let ok = main.append_block("ok");
    let dispatch = main.append_block("dispatch");
    let handler = main.append_block("handler");
    let value = main.invoke(FunctionType::new(Type::i32(), vec![]), quiet, vec![], ok, dispatch);
    main.position_at(ok);
    main.ret(Some(value));
    main.position_at(dispatch);
    let switch = main.catch_switch(vec![handler], None);
    main.position_at(handler);
    let pad = main.catch_pad(switch, vec![Operand::null(), Operand::int(32, 64), Operand::null()]);
    main.catch_ret(pad, ok);
    main.finish();

    let module = translate(&builder.finish())?;
    let main = method(&module, "main");
    assert!(main.body.regions.is_empty());
    assert!(!main.body.ops.iter().any(|op| matches!(op, Op::Leave(_))));
    Ok(())
}

#[test]
fn exception_constructs_need_a_personality() {
    let mut builder = ModuleBuilder::new("eh");
    let mut f = builder.function("f", FunctionType::new(Type::Void, vec![]));
    let entry = f.append_block("entry");
    let cleanup = f.append_block("cleanup");
    f.br(cleanup);
    f.position_at(cleanup);
    let pad = f.cleanup_pad(vec![]);
    f.cleanup_ret(pad, Some(entry));
    f.finish();

    let err = translate_module(&builder.finish(), &TranslationOptions::default()).unwrap_err();
    assert_eq!(err.defect(), Some(&StructuralDefect::MissingPersonality));
}

#[test]
fn unknown_comparison_predicate_is_a_defect() {
    let mut builder = ModuleBuilder::new("cmp");
    let mut f = builder.function("f", FunctionType::new(Type::i1(), vec![Type::i32()]));
    let x = f.param(0);
    let flag = f.icmp(predicate::ICMP_SLE + 1, x.clone(), x);
    f.ret(Some(flag));
    f.finish();

    let err = translate_module(&builder.finish(), &TranslationOptions::default()).unwrap_err();
    assert_eq!(
        err.defect(),
        Some(&StructuralDefect::UnknownPredicate(predicate::ICMP_SLE + 1))
    );
}
