use crate::naming::{clean_name, strip_aggregate_tag, NameScope};
use ib_bytecode::{FieldDef, RecordDef, RecordId, TypeSig};
use ib_ir as ir;
use std::collections::HashMap;

/// One registered aggregate. Field order is the source declaration order.
#[derive(Debug, Clone)]
pub struct AggregateEntry {
    pub mangled_name: String,
    pub name: String,
    pub record: RecordId,
    pub fields: Vec<ir::Type>,
    pub field_types: Vec<TypeSig>,
    pub packed: bool,
}

impl AggregateEntry {
    pub fn field_name(index: usize) -> String {
        format!("field_{}", index)
    }
}

#[derive(Debug, Default)]
pub struct AggregateRegistry {
    entries: Vec<AggregateEntry>,
    by_mangled: HashMap<String, RecordId>,
    names: NameScope,
}

impl AggregateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mangled: &str) -> Option<&AggregateEntry> {
        let id = self.by_mangled.get(mangled)?;
        self.entries.get(id.0 as usize)
    }

    pub fn entry(&self, id: RecordId) -> Option<&AggregateEntry> {
        self.entries.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers an aggregate before its field types are known, so that a field
    /// mentioning the aggregate again resolves to the same record.
    pub fn register(
        &mut self,
        mangled: &str,
        display_base: Option<&str>,
        fields: Vec<ir::Type>,
        packed: bool,
    ) -> RecordId {
        if let Some(id) = self.by_mangled.get(mangled) {
            return *id;
        }
        let base = match display_base {
            Some(base) => base.to_string(),
            None => clean_name(strip_aggregate_tag(mangled), "Struct"),
        };
        let name = self.names.claim(&base);
        let id = RecordId(self.entries.len() as u32);
        self.entries.push(AggregateEntry {
            mangled_name: mangled.to_string(),
            name,
            record: id,
            fields,
            field_types: Vec::new(),
            packed,
        });
        self.by_mangled.insert(mangled.to_string(), id);
        id
    }

    pub(crate) fn push_field_type(&mut self, id: RecordId, ty: TypeSig) {
        if let Some(entry) = self.entries.get_mut(id.0 as usize) {
            entry.field_types.push(ty);
        }
    }

    pub fn records(&self) -> Vec<RecordDef> {
        self.entries
            .iter()
            .map(|entry| RecordDef {
                name: entry.name.clone(),
                mangled_name: entry.mangled_name.clone(),
                fields: entry
                    .field_types
                    .iter()
                    .enumerate()
                    .map(|(index, ty)| FieldDef {
                        name: AggregateEntry::field_name(index),
                        ty: ty.clone(),
                    })
                    .collect(),
                packed: entry.packed,
            })
            .collect()
    }
}
