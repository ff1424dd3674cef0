//! Byte-addressed storage for statics and heap blocks.
//!
//! Scalars are stored little-endian. Values without a byte representation
//! (pointers, method pointers, variadic lists) live in a side table keyed by offset;
//! the bytes underneath them read as zero.

use crate::value::{round_float, Region, Value};
use crate::VmError;
use ib_bytecode::layout::{record_layout, size_of};
use ib_bytecode::{RecordDef, StaticDef, TypeSig};
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct Block {
    bytes: Vec<u8>,
    references: BTreeMap<u64, Value>,
}

impl Block {
    pub fn zeroed(size: u64) -> Self {
        Self {
            bytes: vec![0; size as usize],
            references: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn range(&self, offset: u64, size: u64) -> Result<std::ops::Range<usize>, VmError> {
        let end = offset.checked_add(size).filter(|end| *end <= self.len());
        match end {
            Some(end) => Ok(offset as usize..end as usize),
            None => Err(VmError::Runtime {
                message: format!(
                    "access of {} bytes at offset {} outside a block of {} bytes",
                    size,
                    offset,
                    self.len()
                ),
            }),
        }
    }

    fn clear_references(&mut self, offset: u64, size: u64) {
        let doomed: Vec<u64> = self
            .references
            .range(offset..offset.saturating_add(size))
            .map(|(at, _)| *at)
            .collect();
        for at in doomed {
            self.references.remove(&at);
        }
    }

    pub fn read_bytes(&self, offset: u64, size: u64) -> Result<&[u8], VmError> {
        let range = self.range(offset, size)?;
        Ok(&self.bytes[range])
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), VmError> {
        let range = self.range(offset, data.len() as u64)?;
        self.clear_references(offset, data.len() as u64);
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn write_reference(&mut self, offset: u64, value: Value) -> Result<(), VmError> {
        self.write_bytes(offset, &[0; 8])?;
        if value != Value::Null {
            self.references.insert(offset, value);
        }
        Ok(())
    }

    /// Copies `size` bytes together with any references they carry.
    fn snapshot(&self, offset: u64, size: u64) -> Result<Block, VmError> {
        let bytes = self.read_bytes(offset, size)?.to_vec();
        let references = self
            .references
            .range(offset..offset + size)
            .map(|(at, value)| (at - offset, value.clone()))
            .collect();
        Ok(Block { bytes, references })
    }

    fn restore(&mut self, offset: u64, chunk: Block) -> Result<(), VmError> {
        self.write_bytes(offset, &chunk.bytes)?;
        for (at, value) in chunk.references {
            self.references.insert(offset + at, value);
        }
        Ok(())
    }

    pub fn resize(&mut self, size: u64) {
        self.bytes.resize(size as usize, 0);
        self.clear_references(size, u64::MAX - size);
    }
}

#[derive(Debug, Default)]
pub struct Memory {
    statics: Vec<Block>,
    heap: Vec<Option<Block>>,
}

impl Memory {
    pub fn new(statics: &[StaticDef], records: &[RecordDef]) -> Self {
        let statics = statics
            .iter()
            .map(|def| {
                let mut block = Block::zeroed(size_of(&def.ty, records));
                if let Some(init) = &def.init {
                    let len = init.len().min(block.bytes.len());
                    block.bytes[..len].copy_from_slice(&init[..len]);
                }
                block
            })
            .collect();
        Self {
            statics,
            heap: Vec::new(),
        }
    }

    pub fn allocate(&mut self, size: u64) -> Region {
        self.heap.push(Some(Block::zeroed(size)));
        let region = Region::Heap((self.heap.len() - 1) as u32);
        trace!("allocated {} bytes as {:?}", size, region);
        region
    }

    pub fn free(&mut self, region: Region) -> Result<(), VmError> {
        match region {
            Region::Heap(id) => match self.heap.get_mut(id as usize) {
                Some(slot @ Some(_)) => {
                    *slot = None;
                    Ok(())
                }
                _ => Err(VmError::Runtime {
                    message: format!("double free of heap block {}", id),
                }),
            },
            Region::Static(id) => Err(VmError::Runtime {
                message: format!("free of static {}", id),
            }),
        }
    }

    pub fn block(&self, region: Region) -> Result<&Block, VmError> {
        let block = match region {
            Region::Static(id) => self.statics.get(id as usize),
            Region::Heap(id) => self.heap.get(id as usize).and_then(Option::as_ref),
        };
        block.ok_or_else(|| VmError::Runtime {
            message: format!("dangling address into {:?}", region),
        })
    }

    pub fn block_mut(&mut self, region: Region) -> Result<&mut Block, VmError> {
        let block = match region {
            Region::Static(id) => self.statics.get_mut(id as usize),
            Region::Heap(id) => self.heap.get_mut(id as usize).and_then(Option::as_mut),
        };
        block.ok_or_else(|| VmError::Runtime {
            message: format!("dangling address into {:?}", region),
        })
    }

    pub fn load(
        &self,
        region: Region,
        offset: u64,
        ty: &TypeSig,
        records: &[RecordDef],
    ) -> Result<Value, VmError> {
        let block = self.block(region)?;
        load_value(block, offset, ty, records)
    }

    pub fn store(
        &mut self,
        region: Region,
        offset: u64,
        ty: &TypeSig,
        value: Value,
        records: &[RecordDef],
    ) -> Result<(), VmError> {
        let block = self.block_mut(region)?;
        store_value(block, offset, ty, value, records)
    }

    /// Overlapping ranges are handled by copying through a snapshot.
    pub fn copy(
        &mut self,
        to: (Region, u64),
        from: (Region, u64),
        size: u64,
    ) -> Result<(), VmError> {
        let chunk = self.block(from.0)?.snapshot(from.1, size)?;
        self.block_mut(to.0)?.restore(to.1, chunk)
    }

    pub fn fill(&mut self, region: Region, offset: u64, byte: u8, size: u64) -> Result<(), VmError> {
        self.block_mut(region)?
            .write_bytes(offset, &vec![byte; size as usize])
    }
}

fn load_value(block: &Block, offset: u64, ty: &TypeSig, records: &[RecordDef]) -> Result<Value, VmError> {
    let value = match ty {
        TypeSig::Bool => Value::Bool(block.read_bytes(offset, 1)?[0] != 0),
        TypeSig::Int(width) => {
            let size = u64::from(width.bits() / 8);
            let mut raw = [0u8; 16];
            raw[..size as usize].copy_from_slice(block.read_bytes(offset, size)?);
            Value::int(*width, i128::from_le_bytes(raw))
        }
        TypeSig::Single => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(block.read_bytes(offset, 4)?);
            Value::single(f32::from_le_bytes(raw))
        }
        TypeSig::Double => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(block.read_bytes(offset, 8)?);
            Value::double(f64::from_le_bytes(raw))
        }
        TypeSig::Pointer(_) | TypeSig::VarArgs => {
            block.read_bytes(offset, 8)?;
            block
                .references
                .get(&offset)
                .cloned()
                .unwrap_or(Value::Null)
        }
        TypeSig::Array(elem, len) => {
            let stride = size_of(elem, records);
            let mut items = Vec::with_capacity(*len as usize);
            for index in 0..*len {
                items.push(load_value(block, offset + index * stride, elem, records)?);
            }
            Value::Array(items)
        }
        TypeSig::Record(id) => {
            let record = record_def(records, id.0)?;
            let layout = record_layout(record, records);
            let mut fields = Vec::with_capacity(record.fields.len());
            for (field, at) in record.fields.iter().zip(&layout.field_offsets) {
                fields.push(load_value(block, offset + at, &field.ty, records)?);
            }
            Value::Record(fields)
        }
        TypeSig::Half | TypeSig::Void => {
            return Err(VmError::Unsupported {
                message: format!("memory load of {:?}", ty),
            })
        }
    };
    Ok(value)
}

fn store_value(
    block: &mut Block,
    offset: u64,
    ty: &TypeSig,
    value: Value,
    records: &[RecordDef],
) -> Result<(), VmError> {
    match (ty, value) {
        (TypeSig::Bool, value) => {
            let bit = value.is_truthy().unwrap_or(false);
            block.write_bytes(offset, &[u8::from(bit)])
        }
        (TypeSig::Int(width), value) => {
            let raw = value.as_i128().ok_or_else(|| VmError::Runtime {
                message: format!("storing {:?} as an integer", value),
            })?;
            let size = (width.bits() / 8) as usize;
            block.write_bytes(offset, &raw.to_le_bytes()[..size])
        }
        (TypeSig::Single, Value::Float { value, .. }) => {
            block.write_bytes(offset, &(value as f32).to_le_bytes())
        }
        (TypeSig::Double, Value::Float { kind, value }) => {
            block.write_bytes(offset, &round_float(kind, value).to_le_bytes())
        }
        (TypeSig::Pointer(_) | TypeSig::VarArgs, value) => block.write_reference(offset, value),
        (TypeSig::Array(elem, _), Value::Array(items)) => {
            let stride = size_of(elem, records);
            for (index, item) in items.into_iter().enumerate() {
                store_value(block, offset + index as u64 * stride, elem, item, records)?;
            }
            Ok(())
        }
        (TypeSig::Record(id), Value::Record(fields)) => {
            let record = record_def(records, id.0)?;
            let layout = record_layout(record, records);
            for ((field, at), item) in record.fields.iter().zip(&layout.field_offsets).zip(fields) {
                store_value(block, offset + at, &field.ty, item, records)?;
            }
            Ok(())
        }
        (ty, value) => Err(VmError::Unsupported {
            message: format!("memory store of {:?} as {:?}", value, ty),
        }),
    }
}

fn record_def(records: &[RecordDef], id: u32) -> Result<&RecordDef, VmError> {
    records.get(id as usize).ok_or_else(|| VmError::Runtime {
        message: format!("unknown record {}", id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_bytecode::IntWidth;

    #[test]
    fn statics_start_from_their_initializer() {
        let statics = vec![StaticDef {
            name: "answer".to_string(),
            ty: TypeSig::Int(IntWidth::I32),
            init: Some(42i32.to_le_bytes().to_vec()),
        }];
        let memory = Memory::new(&statics, &[]);
        let value = memory
            .load(Region::Static(0), 0, &TypeSig::Int(IntWidth::I32), &[])
            .unwrap();
        assert_eq!(value, Value::i32(42));
    }

    #[test]
    fn byte_writes_clear_stored_references() {
        let mut memory = Memory::default();
        let region = memory.allocate(16);
        let pointer = Value::MethodPointer(3);
        let ptr = TypeSig::opaque_pointer();
        memory.store(region, 8, &ptr, pointer.clone(), &[]).unwrap();
        assert_eq!(memory.load(region, 8, &ptr, &[]).unwrap(), pointer);

        memory.fill(region, 0, 0, 16).unwrap();
        assert_eq!(memory.load(region, 8, &ptr, &[]).unwrap(), Value::Null);
    }

    #[test]
    fn overlapping_copy_moves_forward() {
        let mut memory = Memory::default();
        let region = memory.allocate(4);
        memory.block_mut(region).unwrap().write_bytes(0, &[1, 2, 3, 4]).unwrap();
        memory.copy((region, 1), (region, 0), 3).unwrap();
        assert_eq!(memory.block(region).unwrap().read_bytes(0, 4).unwrap(), &[1, 1, 2, 3]);
    }

    #[test]
    fn freed_blocks_dangle() {
        let mut memory = Memory::default();
        let region = memory.allocate(1);
        memory.free(region).unwrap();
        assert!(memory.block(region).is_err());
        assert!(memory.free(region).is_err());
    }
}
