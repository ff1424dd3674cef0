//! Stack machine executing translated [`TargetModule`]s.
//!
//! Each call gets a frame with its own arguments and locals and an evaluation stack
//! local to the interpreter loop. Locals are addressed through managed pointers that
//! carry a field/element path; statics and heap blocks are byte-addressed. Calls to
//! runtime entries are served by the VM itself.

mod arith;
mod memory;
mod runtime;
mod value;

pub use memory::{Block, Memory};
pub use value::{default_value, PathStep, Pointer, Region, Value, VarArgList};

use arith::{eval_binary, eval_compare, eval_convert, eval_unary};
use ib_bytecode::layout::record_layout;
use ib_bytecode::{label_positions, LabelId, MethodDef, Op, RecordId, TargetModule, TypeSig};
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, trace};
use value::const_value;

const MAX_CALL_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("vm error: {message}")]
    Runtime { message: String },
    #[error("unsupported bytecode: {message}")]
    Unsupported { message: String },
    #[error("program terminated")]
    Terminated,
    #[error("unhandled exception: {message}")]
    UnhandledException { message: String },
}

/// Failure of one op: an exception that protected regions may catch, or a hard error.
enum Raise {
    Exception(Value),
    Error(VmError),
}

impl From<VmError> for Raise {
    fn from(error: VmError) -> Self {
        Raise::Error(error)
    }
}

enum Flow {
    Next,
    Jump(LabelId),
    /// Jump that also empties the evaluation stack.
    Leave(LabelId),
    Return(Option<Value>),
}

struct Frame {
    method: u32,
    args: Vec<Value>,
    locals: Vec<Value>,
}

pub struct Vm {
    module: Rc<TargetModule>,
    labels: Vec<Rc<HashMap<LabelId, usize>>>,
    frames: Vec<Frame>,
    memory: Memory,
    output: String,
}

impl Vm {
    pub fn new(module: TargetModule) -> Self {
        let labels = module
            .methods
            .iter()
            .map(|method| Rc::new(label_positions(&method.body)))
            .collect();
        let memory = Memory::new(&module.statics, &module.records);
        Self {
            module: Rc::new(module),
            labels,
            frames: Vec::new(),
            memory,
            output: String::new(),
        }
    }

    pub fn module(&self) -> &TargetModule {
        &self.module
    }

    /// Text written through `PutString`, one line per call.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn run(&mut self, name: &str, args: Vec<Value>) -> Result<Option<Value>, VmError> {
        let method = self.module.method_index(name).ok_or_else(|| VmError::Runtime {
            message: format!("missing method {}", name),
        })?;
        self.run_method(method, args)
    }

    pub fn run_method(&mut self, method: u32, args: Vec<Value>) -> Result<Option<Value>, VmError> {
        self.frames.clear();
        match self.invoke(method, args) {
            Ok(value) => Ok(value),
            Err(Raise::Exception(exception)) => Err(VmError::UnhandledException {
                message: describe_exception(&exception),
            }),
            Err(Raise::Error(error)) => Err(error),
        }
    }

    fn invoke(&mut self, method: u32, args: Vec<Value>) -> Result<Option<Value>, Raise> {
        let module = Rc::clone(&self.module);
        let def = module
            .methods
            .get(method as usize)
            .ok_or_else(|| VmError::Runtime {
                message: format!("missing method {}", method),
            })?;
        if args.len() != def.signature.arg_slots() {
            return Err(VmError::Runtime {
                message: format!(
                    "method {} expects {} args but got {}",
                    def.name,
                    def.signature.arg_slots(),
                    args.len()
                ),
            }
            .into());
        }
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(VmError::Runtime {
                message: format!("call depth exceeded entering {}", def.name),
            }
            .into());
        }
        trace!("call {} with {} args", def.name, args.len());
        let locals = def
            .body
            .locals
            .iter()
            .map(|ty| default_value(ty, &module.records))
            .collect();
        self.frames.push(Frame {
            method,
            args,
            locals,
        });
        let result = self.execute(def);
        self.frames.pop();
        result
    }

    fn execute(&mut self, def: &MethodDef) -> Result<Option<Value>, Raise> {
        let frame = self.frames.len() - 1;
        let labels = Rc::clone(&self.labels[self.frames[frame].method as usize]);
        let ops = &def.body.ops;
        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;
        while let Some(op) = ops.get(pc) {
            match self.step(op, frame, def, &mut stack) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(label)) => pc = label_target(&labels, label)?,
                Ok(Flow::Leave(label)) => {
                    stack.clear();
                    pc = label_target(&labels, label)?;
                }
                Ok(Flow::Return(value)) => return Ok(value),
                Err(Raise::Exception(exception)) => match handler_for(def, &labels, pc) {
                    Some(handler) => {
                        debug!(
                            "{} caught {}",
                            def.name,
                            describe_exception(&exception)
                        );
                        stack.clear();
                        stack.push(exception);
                        pc = handler;
                    }
                    None => return Err(Raise::Exception(exception)),
                },
                Err(error) => return Err(error),
            }
        }
        Err(VmError::Runtime {
            message: format!("method {} ran past its last op", def.name),
        }
        .into())
    }

    fn step(
        &mut self,
        op: &Op,
        frame: usize,
        def: &MethodDef,
        stack: &mut Vec<Value>,
    ) -> Result<Flow, Raise> {
        match op {
            Op::Label(_) | Op::Nop => {}
            Op::LoadConst(index) => {
                let value = self
                    .module
                    .const_pool
                    .get(*index as usize)
                    .ok_or_else(|| VmError::Runtime {
                        message: format!("missing const {}", index),
                    })?;
                stack.push(const_value(value, &self.module.records));
            }
            Op::LoadArg(index) => {
                let value = self.frames[frame]
                    .args
                    .get(*index as usize)
                    .cloned()
                    .ok_or_else(|| VmError::Runtime {
                        message: format!("missing argument {}", index),
                    })?;
                stack.push(value);
            }
            Op::LoadLocal(local) => {
                let value = self.local(frame, *local)?.clone();
                stack.push(value);
            }
            Op::StoreLocal(local) => {
                let value = pop(stack)?;
                *self.local_mut(frame, *local)? = value;
            }
            Op::InitLocal(local) => {
                let ty = def.body.locals.get(*local as usize).cloned().unwrap_or(TypeSig::Void);
                let value = default_value(&ty, &self.module.records);
                *self.local_mut(frame, *local)? = value;
            }
            Op::LoadLocalAddress(local) => {
                self.local(frame, *local)?;
                stack.push(Value::Pointer(Pointer::Local {
                    frame,
                    local: *local,
                    path: Vec::new(),
                }));
            }
            Op::LoadStaticAddress(index) => stack.push(Value::Pointer(Pointer::Memory {
                region: Region::Static(*index),
                offset: 0,
            })),
            Op::LoadMethodPointer(index) => stack.push(Value::MethodPointer(*index)),
            Op::LoadIndirect(ty) => {
                let address = pop(stack)?;
                stack.push(self.load_indirect(&address, ty)?);
            }
            Op::StoreIndirect(ty) => {
                let value = pop(stack)?;
                let address = pop(stack)?;
                self.store_indirect(&address, ty, value)?;
            }
            Op::FieldAddress { record, field } => {
                let address = pop(stack)?;
                stack.push(self.field_address(address, *record, *field)?);
            }
            Op::ElementAddress(ty) => {
                let index = pop(stack)?;
                let index = index.as_i128().ok_or_else(|| VmError::Runtime {
                    message: format!("element index {:?} is not an integer", index),
                })?;
                let address = pop(stack)?;
                stack.push(self.element_address(address, ty, index)?);
            }
            Op::Binary { op, kind } => {
                let right = pop(stack)?;
                let left = pop(stack)?;
                stack.push(eval_binary(*op, *kind, left, right)?);
            }
            Op::Unary { op, kind } => {
                let value = pop(stack)?;
                stack.push(eval_unary(*op, *kind, value)?);
            }
            Op::Compare { op, kind } => {
                let right = pop(stack)?;
                let left = pop(stack)?;
                stack.push(Value::Bool(eval_compare(*op, *kind, left, right)?));
            }
            Op::Convert { from, to, signed } => {
                let value = pop(stack)?;
                stack.push(eval_convert(*from, *to, *signed, value)?);
            }
            Op::Call { method, arg_count } => {
                let args = pop_n(stack, *arg_count)?;
                if let Some(value) = self.invoke(*method, args)? {
                    stack.push(value);
                }
            }
            Op::CallIndirect { arg_count, returns } => {
                let callee = pop(stack)?;
                let Value::MethodPointer(method) = callee else {
                    return Err(VmError::Runtime {
                        message: format!("indirect call through {:?}", callee),
                    }
                    .into());
                };
                let args = pop_n(stack, *arg_count)?;
                match (self.invoke(method, args)?, returns) {
                    (Some(value), true) => stack.push(value),
                    (_, false) => {}
                    (None, true) => {
                        return Err(VmError::Runtime {
                            message: format!("method {} returned no value", method),
                        }
                        .into())
                    }
                }
            }
            Op::CallRuntime { entry, arg_count } => {
                let args = pop_n(stack, *arg_count)?;
                if let Some(value) = self.call_runtime(*entry, args)? {
                    stack.push(value);
                }
            }
            Op::PackVarArgs(count) => {
                let values = pop_n(stack, *count)?;
                stack.push(Value::VarArgs(VarArgList { values, cursor: 0 }));
            }
            Op::NextVarArg(_) => {
                let address = pop(stack)?;
                let list = self.load_indirect(&address, &TypeSig::VarArgs)?;
                let Value::VarArgs(mut list) = list else {
                    return Err(VmError::Runtime {
                        message: format!("va_arg over {:?}", list),
                    }
                    .into());
                };
                let value = list.values.get(list.cursor).cloned().ok_or_else(|| {
                    VmError::Runtime {
                        message: "read past the last variadic argument".to_string(),
                    }
                })?;
                list.cursor += 1;
                self.store_indirect(&address, &TypeSig::VarArgs, Value::VarArgs(list))?;
                stack.push(value);
            }
            Op::Dup => {
                let value = stack.last().cloned().ok_or_else(underflow)?;
                stack.push(value);
            }
            Op::Pop => {
                pop(stack)?;
            }
            Op::Branch(label) => return Ok(Flow::Jump(*label)),
            Op::BranchTrue(label) | Op::BranchFalse(label) => {
                let value = pop(stack)?;
                let truth = value.is_truthy().ok_or_else(|| VmError::Runtime {
                    message: format!("branch on {:?}", value),
                })?;
                if truth == matches!(op, Op::BranchTrue(_)) {
                    return Ok(Flow::Jump(*label));
                }
            }
            Op::SwitchValue { cases, default } => {
                let value = pop(stack)?;
                let scrutinee = value.as_i128().ok_or_else(|| VmError::Runtime {
                    message: format!("switch on {:?}", value),
                })?;
                let target = cases
                    .iter()
                    .find(|(case, _)| *case == scrutinee)
                    .map(|(_, label)| *label)
                    .unwrap_or(*default);
                return Ok(Flow::Jump(target));
            }
            Op::Leave(label) => return Ok(Flow::Leave(*label)),
            Op::Return => {
                let value = if def.signature.ret.is_void() {
                    None
                } else {
                    Some(pop(stack)?)
                };
                return Ok(Flow::Return(value));
            }
            Op::Throw => {
                let exception = pop(stack)?;
                debug!("{} throws {}", def.name, describe_exception(&exception));
                return Err(Raise::Exception(exception));
            }
            Op::Unreachable => {
                return Err(VmError::Runtime {
                    message: format!("reached unreachable code in {}", def.name),
                }
                .into())
            }
        }
        Ok(Flow::Next)
    }

    fn local(&self, frame: usize, local: u32) -> Result<&Value, VmError> {
        self.frames
            .get(frame)
            .and_then(|f| f.locals.get(local as usize))
            .ok_or_else(|| VmError::Runtime {
                message: format!("missing local {} in frame {}", local, frame),
            })
    }

    fn local_mut(&mut self, frame: usize, local: u32) -> Result<&mut Value, VmError> {
        self.frames
            .get_mut(frame)
            .and_then(|f| f.locals.get_mut(local as usize))
            .ok_or_else(|| VmError::Runtime {
                message: format!("missing local {} in frame {}", local, frame),
            })
    }

    /// Declared type of the object a local pointer designates.
    fn local_type(&self, frame: usize, local: u32, path: &[PathStep]) -> Result<TypeSig, VmError> {
        let missing = || VmError::Runtime {
            message: format!("address of local {} in frame {} is stale", local, frame),
        };
        let method = self.frames.get(frame).ok_or_else(missing)?.method;
        let mut ty = self.module.methods[method as usize]
            .body
            .locals
            .get(local as usize)
            .cloned()
            .ok_or_else(missing)?;
        for step in path {
            ty = match (step, ty) {
                (PathStep::Field(index), TypeSig::Record(id)) => self
                    .module
                    .record(id)
                    .and_then(|record| record.fields.get(*index as usize))
                    .map(|field| field.ty.clone())
                    .ok_or_else(missing)?,
                (PathStep::Element(_), TypeSig::Array(elem, _)) => *elem,
                (step, ty) => {
                    return Err(VmError::Runtime {
                        message: format!("cannot apply {:?} to {:?}", step, ty),
                    })
                }
            };
        }
        Ok(ty)
    }

    fn pointee_type(&self, address: &Value) -> Option<TypeSig> {
        match address {
            Value::Pointer(Pointer::Local { frame, local, path }) => {
                self.local_type(*frame, *local, path).ok()
            }
            _ => None,
        }
    }

    fn place(&self, frame: usize, local: u32, path: &[PathStep]) -> Result<&Value, VmError> {
        let mut value = self.local(frame, local)?;
        for step in path {
            value = match (step, value) {
                (PathStep::Field(index), Value::Record(fields)) => fields.get(*index as usize),
                (PathStep::Element(index), Value::Array(items)) => {
                    usize::try_from(*index).ok().and_then(|i| items.get(i))
                }
                _ => None,
            }
            .ok_or_else(|| out_of_object(step))?;
        }
        Ok(value)
    }

    fn place_mut(
        &mut self,
        frame: usize,
        local: u32,
        path: &[PathStep],
    ) -> Result<&mut Value, VmError> {
        let mut value = self.local_mut(frame, local)?;
        for step in path {
            value = match (step, value) {
                (PathStep::Field(index), Value::Record(fields)) => fields.get_mut(*index as usize),
                (PathStep::Element(index), Value::Array(items)) => {
                    usize::try_from(*index).ok().and_then(|i| items.get_mut(i))
                }
                _ => None,
            }
            .ok_or_else(|| out_of_object(step))?;
        }
        Ok(value)
    }

    fn load_indirect(&self, address: &Value, ty: &TypeSig) -> Result<Value, VmError> {
        match address {
            Value::Pointer(Pointer::Local { frame, local, path }) => {
                Ok(self.place(*frame, *local, path)?.clone())
            }
            Value::Pointer(Pointer::Memory { region, offset }) => {
                self.memory.load(*region, *offset, ty, &self.module.records)
            }
            other => Err(bad_address(other)),
        }
    }

    fn store_indirect(&mut self, address: &Value, ty: &TypeSig, value: Value) -> Result<(), VmError> {
        match address {
            Value::Pointer(Pointer::Local { frame, local, path }) => {
                *self.place_mut(*frame, *local, path)? = value;
                Ok(())
            }
            Value::Pointer(Pointer::Memory { region, offset }) => {
                self.memory
                    .store(*region, *offset, ty, value, &self.module.records)
            }
            other => Err(bad_address(other)),
        }
    }

    fn field_address(&self, address: Value, record: RecordId, field: u32) -> Result<Value, VmError> {
        match address {
            Value::Pointer(Pointer::Local {
                frame,
                local,
                mut path,
            }) => {
                path.push(PathStep::Field(field));
                Ok(Value::Pointer(Pointer::Local { frame, local, path }))
            }
            Value::Pointer(Pointer::Memory { region, offset }) => {
                let def = self.module.record(record).ok_or_else(|| VmError::Runtime {
                    message: format!("unknown record {}", record.0),
                })?;
                let layout = record_layout(def, &self.module.records);
                let at = layout
                    .field_offsets
                    .get(field as usize)
                    .ok_or_else(|| out_of_object(&PathStep::Field(field)))?;
                Ok(Value::Pointer(Pointer::Memory {
                    region,
                    offset: offset + at,
                }))
            }
            other => Err(bad_address(&other)),
        }
    }

    /// Indexing into an array object descends into it; otherwise the index strides
    /// over sibling elements of the current position.
    fn element_address(&self, address: Value, ty: &TypeSig, index: i128) -> Result<Value, VmError> {
        match address {
            Value::Pointer(Pointer::Local {
                frame,
                local,
                mut path,
            }) => {
                let step = i64::try_from(index).map_err(|_| VmError::Runtime {
                    message: format!("element index {} out of range", index),
                })?;
                let descends = matches!(
                    self.local_type(frame, local, &path)?,
                    TypeSig::Array(ref elem, _) if **elem == *ty
                );
                if descends {
                    path.push(PathStep::Element(step));
                } else {
                    match path.last_mut() {
                        Some(PathStep::Element(at)) => *at += step,
                        _ if step == 0 => {}
                        _ => {
                            return Err(VmError::Unsupported {
                                message: format!(
                                    "pointer arithmetic by {} outside local {}",
                                    step, local
                                ),
                            })
                        }
                    }
                }
                Ok(Value::Pointer(Pointer::Local { frame, local, path }))
            }
            Value::Pointer(Pointer::Memory { region, offset }) => {
                let stride = ib_bytecode::layout::size_of(ty, &self.module.records);
                let target = i128::from(offset) + index * i128::from(stride);
                let offset = u64::try_from(target).map_err(|_| VmError::Runtime {
                    message: format!("address arithmetic below the start of {:?}", region),
                })?;
                Ok(Value::Pointer(Pointer::Memory { region, offset }))
            }
            other => Err(bad_address(&other)),
        }
    }
}

fn label_target(labels: &HashMap<LabelId, usize>, label: LabelId) -> Result<usize, VmError> {
    labels.get(&label).copied().ok_or_else(|| VmError::Runtime {
        message: format!("jump to unmarked label L{}", label.0),
    })
}

/// Handler of the innermost region whose protected range contains `pc`.
fn handler_for(def: &MethodDef, labels: &HashMap<LabelId, usize>, pc: usize) -> Option<usize> {
    def.body
        .regions
        .iter()
        .filter_map(|region| {
            let start = *labels.get(&region.try_start)?;
            let end = *labels.get(&region.try_end)?;
            let handler = *labels.get(&region.handler_start)?;
            (start < pc && pc < end).then_some((start, handler))
        })
        .max_by_key(|(start, _)| *start)
        .map(|(_, handler)| handler)
}

fn describe_exception(exception: &Value) -> String {
    match exception {
        Value::Exception(message) => message.clone(),
        other => format!("{:?}", other),
    }
}

fn underflow() -> VmError {
    VmError::Runtime {
        message: "stack underflow".to_string(),
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, VmError> {
    stack.pop().ok_or_else(underflow)
}

fn pop_n(stack: &mut Vec<Value>, count: u32) -> Result<Vec<Value>, VmError> {
    let count = count as usize;
    if stack.len() < count {
        return Err(underflow());
    }
    Ok(stack.split_off(stack.len() - count))
}

fn bad_address(value: &Value) -> VmError {
    match value {
        Value::Null => VmError::Runtime {
            message: "null dereference".to_string(),
        },
        other => VmError::Runtime {
            message: format!("{:?} is not an address", other),
        },
    }
}

fn out_of_object(step: &PathStep) -> VmError {
    VmError::Runtime {
        message: format!("{:?} is outside the addressed object", step),
    }
}
