//! Runtime support library: allocation, raw memory, variadic lists, output and
//! failure reporting.

use crate::value::{default_value, PathStep, Pointer, Value};
use crate::{Raise, Vm, VmError};
use ib_bytecode::layout::size_of;
use ib_bytecode::{RuntimeEntry, TypeSig};
use tracing::{debug, trace};

fn argument(args: &[Value], index: usize, entry: RuntimeEntry) -> Result<&Value, VmError> {
    args.get(index).ok_or_else(|| VmError::Runtime {
        message: format!("{} expects {} arguments", entry, entry.arity()),
    })
}

fn size_argument(args: &[Value], index: usize, entry: RuntimeEntry) -> Result<u64, VmError> {
    let value = argument(args, index, entry)?;
    value
        .as_i128()
        .and_then(|size| u64::try_from(size).ok())
        .ok_or_else(|| VmError::Runtime {
            message: format!("{} got an invalid size {:?}", entry, value),
        })
}

impl Vm {
    pub(crate) fn call_runtime(
        &mut self,
        entry: RuntimeEntry,
        args: Vec<Value>,
    ) -> Result<Option<Value>, Raise> {
        trace!("runtime {} with {} args", entry, args.len());
        let result = match entry {
            RuntimeEntry::Alloc => {
                let size = size_argument(&args, 0, entry)?;
                Some(self.allocate(size))
            }
            RuntimeEntry::ReAlloc => {
                let size = size_argument(&args, 1, entry)?;
                match argument(&args, 0, entry)? {
                    Value::Null => Some(self.allocate(size)),
                    Value::Pointer(Pointer::Memory { region, offset: 0 }) => {
                        self.memory.block_mut(*region)?.resize(size);
                        Some(args[0].clone())
                    }
                    other => {
                        return Err(VmError::Runtime {
                            message: format!("realloc of {:?}", other),
                        }
                        .into())
                    }
                }
            }
            RuntimeEntry::Free => {
                match argument(&args, 0, entry)? {
                    Value::Null => {}
                    Value::Pointer(Pointer::Memory { region, offset: 0 }) => {
                        self.memory.free(*region)?
                    }
                    other => {
                        return Err(VmError::Runtime {
                            message: format!("free of {:?}", other),
                        }
                        .into())
                    }
                }
                None
            }
            // in-place growth is never possible; the block stays untouched
            RuntimeEntry::Expand => Some(Value::Null),
            RuntimeEntry::MemCopy | RuntimeEntry::MemMove => {
                let size = size_argument(&args, 2, entry)?;
                self.copy_memory(
                    argument(&args, 0, entry)?,
                    argument(&args, 1, entry)?,
                    size,
                )?;
                None
            }
            RuntimeEntry::MemSet => {
                let byte = argument(&args, 1, entry)?.as_i128().unwrap_or(0) as u8;
                let size = size_argument(&args, 2, entry)?;
                self.fill_memory(argument(&args, 0, entry)?, byte, size)?;
                None
            }
            RuntimeEntry::VaCopy => {
                let list = self.load_indirect(argument(&args, 1, entry)?, &TypeSig::VarArgs)?;
                self.store_indirect(argument(&args, 0, entry)?, &TypeSig::VarArgs, list)?;
                None
            }
            RuntimeEntry::PutString => {
                let units = self.read_string(argument(&args, 0, entry)?, 1)?;
                let bytes: Vec<u8> = units.into_iter().map(|unit| unit as u8).collect();
                self.output.push_str(&String::from_utf8_lossy(&bytes));
                self.output.push('\n');
                Some(Value::i32(0))
            }
            RuntimeEntry::AssertFailure => {
                let message = self.read_wide_string(argument(&args, 0, entry)?)?;
                let file = self.read_wide_string(argument(&args, 1, entry)?)?;
                let line = argument(&args, 2, entry)?.as_i128().unwrap_or(0);
                let text = format!("Assertion failed: {} at {}:{}", message, file, line);
                debug!("{}", text);
                return Err(Raise::Exception(Value::Exception(text)));
            }
            RuntimeEntry::Terminate => return Err(VmError::Terminated.into()),
        };
        Ok(result)
    }

    fn allocate(&mut self, size: u64) -> Value {
        let region = self.memory.allocate(size);
        Value::Pointer(Pointer::Memory { region, offset: 0 })
    }

    /// Byte copies between static or heap blocks; when a local is involved the copy
    /// must cover the whole object the local pointer designates.
    fn copy_memory(&mut self, to: &Value, from: &Value, size: u64) -> Result<(), VmError> {
        if size == 0 {
            return Ok(());
        }
        if let (
            Value::Pointer(Pointer::Memory {
                region: to_region,
                offset: to_offset,
            }),
            Value::Pointer(Pointer::Memory {
                region: from_region,
                offset: from_offset,
            }),
        ) = (to, from)
        {
            return self
                .memory
                .copy((*to_region, *to_offset), (*from_region, *from_offset), size);
        }
        let ty = self
            .pointee_type(to)
            .or_else(|| self.pointee_type(from))
            .ok_or_else(|| VmError::Runtime {
                message: format!("memory copy from {:?} to {:?}", from, to),
            })?;
        self.ensure_whole_object(&ty, size)?;
        let value = self.load_indirect(from, &ty)?;
        self.store_indirect(to, &ty, value)
    }

    fn fill_memory(&mut self, to: &Value, byte: u8, size: u64) -> Result<(), VmError> {
        match to {
            Value::Pointer(Pointer::Memory { region, offset }) => {
                self.memory.fill(*region, *offset, byte, size)
            }
            Value::Pointer(Pointer::Local { .. }) => {
                let ty = self.pointee_type(to).unwrap_or(TypeSig::Void);
                self.ensure_whole_object(&ty, size)?;
                if byte != 0 {
                    return Err(VmError::Unsupported {
                        message: format!("memset of a local with byte {}", byte),
                    });
                }
                let value = default_value(&ty, &self.module.records);
                self.store_indirect(to, &ty, value)
            }
            other => Err(VmError::Runtime {
                message: format!("memset of {:?}", other),
            }),
        }
    }

    fn ensure_whole_object(&self, ty: &TypeSig, size: u64) -> Result<(), VmError> {
        let expected = size_of(ty, &self.module.records);
        if expected != size {
            return Err(VmError::Unsupported {
                message: format!(
                    "partial copy of {} bytes over a {}-byte local object",
                    size, expected
                ),
            });
        }
        Ok(())
    }

    /// Zero-terminated string of `unit`-byte code units.
    fn read_string(&self, address: &Value, unit: u64) -> Result<Vec<u32>, VmError> {
        let mut units = Vec::new();
        match address {
            Value::Null => {}
            Value::Pointer(Pointer::Memory { region, offset }) => {
                let block = self.memory.block(*region)?;
                let mut at = *offset;
                while at + unit <= block.len() {
                    let raw = block.read_bytes(at, unit)?;
                    let code = raw
                        .iter()
                        .rev()
                        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));
                    if code == 0 {
                        break;
                    }
                    units.push(code);
                    at += unit;
                }
            }
            Value::Pointer(Pointer::Local { frame, local, path }) => {
                let (parent, start) = match path.split_last() {
                    Some((PathStep::Element(index), parent)) => (parent, *index),
                    _ => (path.as_slice(), 0),
                };
                if let Value::Array(items) = self.place(*frame, *local, parent)? {
                    let start = usize::try_from(start).unwrap_or(items.len());
                    for item in items.iter().skip(start) {
                        match item.as_i128() {
                            Some(0) | None => break,
                            Some(code) => units.push(code as u32),
                        }
                    }
                }
            }
            other => {
                return Err(VmError::Runtime {
                    message: format!("{:?} is not a string address", other),
                })
            }
        }
        Ok(units)
    }

    fn read_wide_string(&self, address: &Value) -> Result<String, VmError> {
        let units: Vec<u16> = self
            .read_string(address, 2)?
            .into_iter()
            .map(|unit| unit as u16)
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_bytecode::{IntWidth, StaticDef, TargetModule};

    fn vm_with_static(bytes: &[u8]) -> Vm {
        let mut module = TargetModule::new("Test");
        module.statics.push(StaticDef {
            name: "text".to_string(),
            ty: TypeSig::Array(Box::new(TypeSig::Int(IntWidth::I8)), bytes.len() as u64),
            init: Some(bytes.to_vec()),
        });
        Vm::new(module)
    }

    fn static_address() -> Value {
        Value::Pointer(Pointer::Memory {
            region: crate::Region::Static(0),
            offset: 0,
        })
    }

    #[test]
    fn expand_always_declines() {
        let mut vm = vm_with_static(&[]);
        let block = vm
            .call_runtime(RuntimeEntry::Alloc, vec![Value::i64(4)])
            .ok()
            .flatten()
            .expect("allocation");
        let result = vm
            .call_runtime(RuntimeEntry::Expand, vec![block, Value::i64(64)])
            .ok()
            .flatten();
        assert_eq!(result, Some(Value::Null));
    }

    #[test]
    fn wide_strings_decode_utf16() {
        let vm = vm_with_static(&[b'o', 0, b'k', 0, 0, 0]);
        assert_eq!(vm.read_wide_string(&static_address()).unwrap(), "ok");
    }

    #[test]
    fn memcpy_between_heap_blocks() {
        let mut vm = vm_with_static(b"abc\0");
        let block = vm.allocate(4);
        vm.copy_memory(&block, &static_address(), 4).unwrap();
        vm.call_runtime(RuntimeEntry::PutString, vec![block]).ok();
        assert_eq!(vm.output(), "abc\n");
    }
}
