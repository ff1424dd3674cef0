use ib_bytecode::{Const, FloatKind, IntWidth, RecordDef, TypeSig};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    /// Two's complement value, kept sign-extended to `i128` at its width.
    Int { width: IntWidth, value: i128 },
    Float { kind: FloatKind, value: f64 },
    Null,
    Pointer(Pointer),
    MethodPointer(u32),
    Record(Vec<Value>),
    Array(Vec<Value>),
    VarArgs(VarArgList),
    Exception(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pointer {
    /// Managed address of a local slot, or a field/element inside it.
    Local {
        frame: usize,
        local: u32,
        path: Vec<PathStep>,
    },
    /// Byte address inside a static or heap block.
    Memory { region: Region, offset: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStep {
    Field(u32),
    Element(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    Static(u32),
    Heap(u32),
}

/// Packed trailing arguments and the position of the next one to read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VarArgList {
    pub values: Vec<Value>,
    pub cursor: usize,
}

impl Value {
    pub fn int(width: IntWidth, value: i128) -> Self {
        Value::Int {
            width,
            value: width.normalize(value),
        }
    }

    pub fn i32(value: i32) -> Self {
        Value::int(IntWidth::I32, i128::from(value))
    }

    pub fn i64(value: i64) -> Self {
        Value::int(IntWidth::I64, i128::from(value))
    }

    pub fn double(value: f64) -> Self {
        Value::Float {
            kind: FloatKind::Double,
            value,
        }
    }

    pub fn single(value: f32) -> Self {
        Value::Float {
            kind: FloatKind::Single,
            value: f64::from(value),
        }
    }

    /// Integer view used by branches, switches and indexing; bools read as 0/1.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int { value, .. } => Some(*value),
            Value::Bool(value) => Some(i128::from(*value)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            Value::Int { value, .. } => Some(*value != 0),
            Value::Null => Some(false),
            Value::Pointer(_) | Value::MethodPointer(_) => Some(true),
            _ => None,
        }
    }
}

/// Rounds a double to the precision of `kind`.
pub fn round_float(kind: FloatKind, value: f64) -> f64 {
    match kind {
        FloatKind::Double => value,
        // halves are carried at single precision
        FloatKind::Single | FloatKind::Half => f64::from(value as f32),
    }
}

pub fn default_value(ty: &TypeSig, records: &[RecordDef]) -> Value {
    match ty {
        TypeSig::Void | TypeSig::Pointer(_) => Value::Null,
        TypeSig::Bool => Value::Bool(false),
        TypeSig::Int(width) => Value::Int {
            width: *width,
            value: 0,
        },
        TypeSig::Half => Value::Float {
            kind: FloatKind::Half,
            value: 0.0,
        },
        TypeSig::Single => Value::Float {
            kind: FloatKind::Single,
            value: 0.0,
        },
        TypeSig::Double => Value::double(0.0),
        TypeSig::Array(elem, len) => {
            Value::Array(vec![default_value(elem, records); *len as usize])
        }
        TypeSig::Record(id) => Value::Record(
            records
                .get(id.0 as usize)
                .map(|record| {
                    record
                        .fields
                        .iter()
                        .map(|field| default_value(&field.ty, records))
                        .collect()
                })
                .unwrap_or_default(),
        ),
        TypeSig::VarArgs => Value::VarArgs(VarArgList::default()),
    }
}

pub fn const_value(value: &Const, records: &[RecordDef]) -> Value {
    match value {
        Const::Bool(value) => Value::Bool(*value),
        Const::Int { width, value } => Value::int(*width, *value),
        Const::Float { kind, value } => Value::Float {
            kind: *kind,
            value: round_float(*kind, *value),
        },
        Const::Null => Value::Null,
        Const::Default(ty) => default_value(ty, records),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_bytecode::{FieldDef, RecordId};

    #[test]
    fn int_values_wrap_at_their_width() {
        assert_eq!(Value::int(IntWidth::I8, 200).as_i128(), Some(-56));
        assert_eq!(Value::int(IntWidth::I32, 1 << 32).as_i128(), Some(0));
    }

    #[test]
    fn default_record_nests_field_defaults() {
        let records = vec![RecordDef {
            name: "Pair".to_string(),
            mangled_name: "struct.Pair".to_string(),
            fields: vec![
                FieldDef {
                    name: "field_0".to_string(),
                    ty: TypeSig::Int(IntWidth::I32),
                },
                FieldDef {
                    name: "field_1".to_string(),
                    ty: TypeSig::Array(Box::new(TypeSig::Bool), 2),
                },
            ],
            packed: false,
        }];
        let value = default_value(&TypeSig::Record(RecordId(0)), &records);
        assert_eq!(
            value,
            Value::Record(vec![
                Value::i32(0),
                Value::Array(vec![Value::Bool(false), Value::Bool(false)]),
            ])
        );
    }
}
