use crate::error::{Location, Result, TranslateError};
use crate::function::FunctionContext;
use crate::instruction::OperandRef;
use crate::naming::{clean_name, function_display_name, NameScope};
use crate::options::TranslationOptions;
use crate::runtime::{route_symbol, RuntimeRoute};
use crate::types::TypeResolver;
use ib_bytecode::{
    validate_module, MethodBodyBuilder, MethodDef, MethodSig, Op, RuntimeEntry, StaticDef,
    TargetModule, Visibility,
};
use ib_ir::{self as ir, Attribute, InstrInfo, Opcode, Operand};
use itertools::Itertools;
use std::collections::HashMap;
use tracing::{debug, trace};

/// A defined source function and the target method(s) it becomes.
#[derive(Debug, Clone)]
pub struct MethodEntry<'a> {
    pub function: &'a ir::Function,
    /// Unique display name.
    pub name: String,
    /// Index of the method holding the translated body.
    pub index: u32,
    /// Index of the public aggregate-returning wrapper, for struct-return functions.
    pub wrapper: Option<u32>,
    pub signature: MethodSig,
    pub may_throw: bool,
}

/// How a call site reaches its callee.
#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    Method {
        index: u32,
        signature: MethodSig,
        may_throw: bool,
    },
    Runtime(RuntimeRoute),
    /// Through a method pointer computed at run time.
    Indirect,
}

/// Module-wide state: type resolver, method and static tables, options.
///
/// Built in two phases. [`ModuleContext::declare`] resolves every type, names every
/// method and static and computes may-throw; [`ModuleContext::translate`] then lowers
/// bodies against the now read-only tables.
#[derive(Debug)]
pub struct ModuleContext<'a> {
    source: &'a ir::Module,
    options: &'a TranslationOptions,
    types: TypeResolver,
    methods: Vec<MethodEntry<'a>>,
    by_mangled: HashMap<&'a str, usize>,
    statics: Vec<StaticDef>,
    static_index: HashMap<&'a str, u32>,
}

impl<'a> ModuleContext<'a> {
    pub fn declare(source: &'a ir::Module, options: &'a TranslationOptions) -> Result<Self> {
        debug!("declaring module {}", source.name);
        let types = resolve_types(source)?;

        let mut static_names = NameScope::new();
        let mut statics = Vec::with_capacity(source.globals.len());
        let mut static_index = HashMap::new();
        for global in &source.globals {
            let ty = types
                .lookup(&global.ty)
                .cloned()
                .ok_or_else(|| TranslateError::UnsupportedType {
                    ty: global.ty.to_string(),
                })?;
            static_index.insert(global.name.as_str(), statics.len() as u32);
            statics.push(StaticDef {
                name: static_names.claim(&clean_name(&global.name, "Global")),
                ty,
                init: global.initializer.clone(),
            });
        }

        let defined = source
            .functions
            .iter()
            .filter(|function| !function.is_declaration())
            .collect_vec();
        let mut method_names = NameScope::new();
        let mut methods = Vec::with_capacity(defined.len());
        let mut next_wrapper = defined.len() as u32;
        for (index, function) in defined.into_iter().enumerate() {
            let base = function_display_name(
                &function.name,
                function.demangled_name.as_deref(),
                &options.renamed_symbols,
            )?;
            let signature = types.lookup_signature(&function.ty).ok_or_else(|| {
                TranslateError::UnsupportedType {
                    ty: function.ty.to_string(),
                }
            })?;
            let wrapper = (options.emit_public_wrappers && function.struct_return_type().is_some())
                .then(|| {
                    next_wrapper += 1;
                    next_wrapper - 1
                });
            methods.push(MethodEntry {
                function,
                name: method_names.claim(&base),
                index: index as u32,
                wrapper,
                signature,
                may_throw: false,
            });
        }
        let by_mangled = source
            .functions
            .iter()
            .filter(|function| !function.is_declaration())
            .enumerate()
            .map(|(index, function)| (function.name.as_str(), index))
            .collect();

        let mut context = Self {
            source,
            options,
            types,
            methods,
            by_mangled,
            statics,
            static_index,
        };
        context.compute_may_throw();
        Ok(context)
    }

    pub fn source(&self) -> &'a ir::Module {
        self.source
    }

    pub fn options(&self) -> &TranslationOptions {
        self.options
    }

    pub fn types(&self) -> &TypeResolver {
        &self.types
    }

    pub fn methods(&self) -> &[MethodEntry<'a>] {
        &self.methods
    }

    pub fn method_entry(&self, mangled: &str) -> Option<&MethodEntry<'a>> {
        self.by_mangled
            .get(mangled)
            .and_then(|index| self.methods.get(*index))
    }

    pub fn static_index(&self, name: &str) -> Option<u32> {
        self.static_index.get(name).copied()
    }

    /// Resolves the callee operand of a call site. A declaration without a runtime
    /// route is an unresolved symbol.
    pub fn call_target(&self, callee: &OperandRef, location: &Location) -> Result<CallTarget> {
        let OperandRef::Function(name) = callee else {
            return Ok(CallTarget::Indirect);
        };
        if let Some(entry) = self.method_entry(name) {
            return Ok(CallTarget::Method {
                index: entry.index,
                signature: entry.signature.clone(),
                may_throw: entry.may_throw,
            });
        }
        match route_symbol(name) {
            Some(route) => Ok(CallTarget::Runtime(route)),
            None => Err(TranslateError::UnresolvedSymbol {
                location: location.clone(),
                symbol: name.clone(),
            }),
        }
    }

    pub fn target_may_throw(&self, target: &CallTarget) -> bool {
        match target {
            CallTarget::Method { may_throw, .. } => *may_throw,
            CallTarget::Runtime(route) => route.may_throw(),
            CallTarget::Indirect => true,
        }
    }

    /// Fixed point over the call graph. A function may throw unless it is `nounwind`,
    /// and does when it unwinds itself, calls a throwing callee or calls indirectly.
    fn compute_may_throw(&mut self) {
        let mut throws = vec![false; self.methods.len()];
        let mut callees: Vec<Vec<usize>> = vec![Vec::new(); self.methods.len()];
        for (index, entry) in self.methods.iter().enumerate() {
            if entry.function.is_nounwind() {
                continue;
            }
            for inst in entry.function.instructions() {
                match inst.opcode {
                    Opcode::Resume => throws[index] = true,
                    // cleanupret without an unwind block unwinds to the caller
                    Opcode::CleanupRet if inst.operands.len() == 1 => throws[index] = true,
                    Opcode::Invoke => throws[index] = true,
                    _ => {}
                }
                if !matches!(inst.opcode, Opcode::Call | Opcode::Invoke) {
                    continue;
                }
                match inst.operands.last() {
                    Some(Operand::Function(name)) => match self.by_mangled.get(name.as_str()) {
                        Some(callee) => callees[index].push(*callee),
                        None => {
                            if route_symbol(name) == Some(RuntimeRoute::Entry(RuntimeEntry::AssertFailure)) {
                                throws[index] = true;
                            }
                        }
                    },
                    _ => throws[index] = true,
                }
            }
        }

        let mut changed = true;
        while changed {
            changed = false;
            for index in 0..self.methods.len() {
                if throws[index] || self.methods[index].function.is_nounwind() {
                    continue;
                }
                if callees[index].iter().any(|callee| throws[*callee]) {
                    throws[index] = true;
                    changed = true;
                }
            }
        }

        for (entry, may_throw) in self.methods.iter_mut().zip(throws) {
            entry.may_throw = may_throw;
        }
        trace!(
            "may throw: [{}]",
            self.methods
                .iter()
                .filter(|entry| entry.may_throw)
                .map(|entry| entry.name.as_str())
                .join(", ")
        );
    }

    /// Lowers every defined function. Either every body lowers or the whole module
    /// fails; nothing partial is returned.
    pub fn translate(&self) -> Result<TargetModule> {
        let mut output = TargetModule::new(self.options.module_name.clone());
        output.records = self.types.records();
        output.statics = self.statics.clone();

        let mut methods = Vec::with_capacity(self.methods.len());
        for entry in &self.methods {
            let mut function = FunctionContext::create(entry, self)?;
            let body = function.lower(self, &mut output)?;
            methods.push(MethodDef {
                name: entry.name.clone(),
                mangled_name: entry.function.name.clone(),
                visibility: if entry.wrapper.is_some() {
                    Visibility::Internal
                } else {
                    Visibility::Public
                },
                signature: entry.signature.clone(),
                parameter_names: parameter_names(entry.function),
                body,
            });
        }
        for entry in self.methods.iter().filter(|entry| entry.wrapper.is_some()) {
            methods.push(self.public_wrapper(entry)?);
        }
        output.methods = methods;

        validate_module(&output)?;
        debug!(
            "translated module {} ({} methods, {} records)",
            output.name,
            output.methods.len(),
            output.records.len()
        );
        Ok(output)
    }

    /// Aggregate-returning entry point for a struct-return function: passes the address
    /// of a default-initialized local as the result pointer and returns the local.
    fn public_wrapper(&self, entry: &MethodEntry<'a>) -> Result<MethodDef> {
        let function = entry.function;
        let ret = function
            .struct_return_type()
            .and_then(|ty| self.types.lookup(ty))
            .cloned()
            .ok_or_else(|| TranslateError::UnsupportedType {
                ty: function.ty.to_string(),
            })?;
        let signature = MethodSig {
            params: entry.signature.params.iter().skip(1).cloned().collect(),
            ret: ret.clone(),
            variadic: entry.signature.variadic,
        };

        let mut body = MethodBodyBuilder::new();
        let result = body.add_local(ret);
        body.emit(Op::InitLocal(result));
        body.emit(Op::LoadLocalAddress(result));
        for arg in 0..signature.arg_slots() {
            body.emit(Op::LoadArg(arg as u32));
        }
        body.emit(Op::Call {
            method: entry.index,
            arg_count: entry.signature.arg_slots() as u32,
        });
        body.emit(Op::LoadLocal(result));
        body.emit(Op::Return);

        Ok(MethodDef {
            name: entry.name.clone(),
            mangled_name: function.name.clone(),
            visibility: Visibility::Public,
            signature,
            parameter_names: parameter_names(function).into_iter().skip(1).collect(),
            body: body.finish()?,
        })
    }
}

fn parameter_names(function: &ir::Function) -> Vec<String> {
    let sret = function.struct_return_type().is_some();
    let mut names = NameScope::new();
    let mut result = function
        .params
        .iter()
        .enumerate()
        .map(|(index, param)| {
            if index == 0 && sret {
                return names.claim("result");
            }
            let fallback = format!("arg{}", index);
            let base = param
                .name
                .as_deref()
                .map(|name| clean_name(name, &fallback))
                .unwrap_or(fallback);
            names.claim(&base)
        })
        .collect_vec();
    if function.is_variadic() {
        result.push(names.claim("varargs"));
    }
    result
}

/// Declaration phase: every type any body can mention is resolved here, so lowering
/// only ever looks types up.
fn resolve_types(source: &ir::Module) -> Result<TypeResolver> {
    let mut types = TypeResolver::new();
    for def in &source.structs {
        types.resolve(&ir::Type::Struct(def.name.clone()), source)?;
    }
    for global in &source.globals {
        types.resolve(&global.ty, source)?;
    }
    for function in &source.functions {
        types.resolve_signature(&function.ty, source)?;
        for attribute in function.params.iter().flat_map(|param| &param.attributes) {
            if let Attribute::StructRet(ty) | Attribute::ByVal(ty) = attribute {
                types.resolve(ty, source)?;
            }
        }
        for inst in function.instructions() {
            types.resolve(&inst.ty, source)?;
            resolve_info(&mut types, &inst.info, source)?;
            let mut pending = inst.operands.iter().collect_vec();
            while let Some(operand) = pending.pop() {
                match operand {
                    Operand::Const(constant) => {
                        types.resolve(&constant.ty(), source)?;
                    }
                    Operand::Expr(expr) => {
                        types.resolve(&expr.ty, source)?;
                        resolve_info(&mut types, &expr.info, source)?;
                        pending.extend(expr.operands.iter());
                    }
                    _ => {}
                }
            }
        }
    }
    trace!("resolved {} aggregates", types.registry().len());
    Ok(types)
}

fn resolve_info(types: &mut TypeResolver, info: &InstrInfo, source: &ir::Module) -> Result<()> {
    match info {
        InstrInfo::Alloca { allocated } => {
            types.resolve(allocated, source)?;
        }
        InstrInfo::Gep { source_element, .. } => {
            types.resolve(source_element, source)?;
        }
        InstrInfo::Call { function_type } => {
            types.resolve_signature(function_type, source)?;
        }
        InstrInfo::None | InstrInfo::Predicate(_) | InstrInfo::Phi { .. } => {}
    }
    Ok(())
}
