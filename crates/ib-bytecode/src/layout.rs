//! Natural-alignment memory layout for byte-addressed storage.

use crate::{IntWidth, RecordDef, TypeSig};

#[derive(Debug, Clone)]
pub struct RecordLayout {
    pub size: u64,
    pub align: u32,
    pub field_offsets: Vec<u64>,
}

pub fn size_of(ty: &TypeSig, records: &[RecordDef]) -> u64 {
    match ty {
        TypeSig::Bool => 1,
        TypeSig::Int(width) => u64::from(width.bits() / 8),
        TypeSig::Half => 2,
        TypeSig::Single => 4,
        TypeSig::Double => 8,
        TypeSig::Pointer(_) | TypeSig::VarArgs => 8,
        TypeSig::Array(elem, len) => size_of(elem, records) * len,
        TypeSig::Record(id) => records
            .get(id.0 as usize)
            .map(|record| record_layout(record, records).size)
            .unwrap_or(0),
        TypeSig::Void => 0,
    }
}

pub fn align_of(ty: &TypeSig, records: &[RecordDef]) -> u32 {
    match ty {
        TypeSig::Bool => 1,
        TypeSig::Int(IntWidth::I128) => 16,
        TypeSig::Int(width) => width.bits() / 8,
        TypeSig::Half => 2,
        TypeSig::Single => 4,
        TypeSig::Double => 8,
        TypeSig::Pointer(_) | TypeSig::VarArgs => 8,
        TypeSig::Array(elem, _) => align_of(elem, records),
        TypeSig::Record(id) => records
            .get(id.0 as usize)
            .map(|record| record_layout(record, records).align)
            .unwrap_or(1),
        TypeSig::Void => 1,
    }
}

pub fn record_layout(record: &RecordDef, records: &[RecordDef]) -> RecordLayout {
    if record.fields.is_empty() {
        return RecordLayout {
            size: 0,
            align: 1,
            field_offsets: Vec::new(),
        };
    }

    let mut offsets = Vec::with_capacity(record.fields.len());
    let mut offset = 0u64;
    let mut max_align = 1u32;

    for field in &record.fields {
        let field_align = if record.packed {
            1
        } else {
            align_of(&field.ty, records)
        };
        max_align = max_align.max(field_align);
        if !record.packed && field_align > 1 {
            offset = align_to(offset, field_align as u64);
        }
        offsets.push(offset);
        offset = offset.saturating_add(size_of(&field.ty, records));
    }

    let align = if record.packed { 1 } else { max_align.max(1) };
    let size = if record.packed {
        offset
    } else {
        align_to(offset, align as u64)
    };

    RecordLayout {
        size,
        align,
        field_offsets: offsets,
    }
}

fn align_to(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    let rem = value % alignment;
    if rem == 0 {
        value
    } else {
        value + (alignment - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldDef;

    fn record(fields: Vec<TypeSig>, packed: bool) -> RecordDef {
        RecordDef {
            name: "R".to_string(),
            mangled_name: "struct.R".to_string(),
            fields: fields
                .into_iter()
                .enumerate()
                .map(|(i, ty)| FieldDef {
                    name: format!("field_{}", i),
                    ty,
                })
                .collect(),
            packed,
        }
    }

    #[test]
    fn natural_alignment_pads_fields() {
        let r = record(
            vec![TypeSig::Int(IntWidth::I8), TypeSig::Int(IntWidth::I32)],
            false,
        );
        let layout = record_layout(&r, &[]);
        assert_eq!(layout.field_offsets, vec![0, 4]);
        assert_eq!(layout.size, 8);
        assert_eq!(layout.align, 4);
    }

    #[test]
    fn packed_records_have_no_padding() {
        let r = record(
            vec![TypeSig::Int(IntWidth::I8), TypeSig::Int(IntWidth::I32)],
            true,
        );
        let layout = record_layout(&r, &[]);
        assert_eq!(layout.field_offsets, vec![0, 1]);
        assert_eq!(layout.size, 5);
    }
}
