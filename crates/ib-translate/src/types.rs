use crate::aggregates::{AggregateEntry, AggregateRegistry};
use crate::error::{Result, TranslateError};
use ib_bytecode::{IntWidth, MethodSig, RecordDef, TypeSig};
use ib_ir as ir;
use std::collections::HashMap;
use tracing::trace;

/// Memoized source-type -> target-type mapping. Owned by the module context.
///
/// `resolve` is only called while declaring the module; lowering uses `lookup`,
/// which never creates new entries.
#[derive(Debug, Default)]
pub struct TypeResolver {
    cache: HashMap<ir::Type, TypeSig>,
    registry: AggregateRegistry,
}

impl TypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&mut self, ty: &ir::Type, module: &ir::Module) -> Result<TypeSig> {
        if let Some(sig) = self.cache.get(ty) {
            return Ok(sig.clone());
        }
        let sig = match ty {
            ir::Type::Void | ir::Type::Label | ir::Type::Token | ir::Type::Metadata => {
                TypeSig::Void
            }
            ir::Type::Int(1) => TypeSig::Bool,
            ir::Type::Int(bits) => {
                let width = IntWidth::from_bits(*bits).ok_or_else(|| {
                    TranslateError::UnsupportedType {
                        ty: ty.to_string(),
                    }
                })?;
                TypeSig::Int(width)
            }
            ir::Type::Half => TypeSig::Half,
            ir::Type::Float => TypeSig::Single,
            ir::Type::Double => TypeSig::Double,
            ir::Type::Pointer | ir::Type::Function(_) => TypeSig::opaque_pointer(),
            ir::Type::Array(elem, len) => TypeSig::Array(Box::new(self.resolve(elem, module)?), *len),
            ir::Type::Vector(elem, len) => {
                TypeSig::Array(Box::new(self.resolve(elem, module)?), u64::from(*len))
            }
            ir::Type::Struct(name) => {
                if let Some(entry) = self.registry.get(name) {
                    // still resolving its fields: a cycle through this aggregate
                    TypeSig::Record(entry.record)
                } else {
                    let (fields, packed) = module
                        .struct_type(name)
                        .map(|def| (def.fields.clone(), def.packed))
                        .unwrap_or_default();
                    self.register_aggregate(name, None, fields, packed, module)?
                }
            }
            ir::Type::Literal { fields, packed } => {
                let key = ty.to_string();
                match self.registry.get(&key) {
                    Some(entry) => TypeSig::Record(entry.record),
                    None => self.register_aggregate(
                        &key,
                        Some("Struct"),
                        fields.clone(),
                        *packed,
                        module,
                    )?,
                }
            }
        };
        self.cache.insert(ty.clone(), sig.clone());
        Ok(sig)
    }

    fn register_aggregate(
        &mut self,
        mangled: &str,
        display_base: Option<&str>,
        fields: Vec<ir::Type>,
        packed: bool,
        module: &ir::Module,
    ) -> Result<TypeSig> {
        let id = self
            .registry
            .register(mangled, display_base, fields.clone(), packed);
        trace!("registered aggregate {} as record {}", mangled, id.0);
        for field in &fields {
            let sig = self.resolve(field, module)?;
            self.registry.push_field_type(id, sig);
        }
        Ok(TypeSig::Record(id))
    }

    pub fn resolve_signature(
        &mut self,
        ty: &ir::FunctionType,
        module: &ir::Module,
    ) -> Result<MethodSig> {
        let params = ty
            .params
            .iter()
            .map(|param| self.resolve(param, module))
            .collect::<Result<Vec<_>>>()?;
        Ok(MethodSig {
            params,
            ret: self.resolve(&ty.ret, module)?,
            variadic: ty.variadic,
        })
    }

    pub fn lookup(&self, ty: &ir::Type) -> Option<&TypeSig> {
        self.cache.get(ty)
    }

    pub fn lookup_signature(&self, ty: &ir::FunctionType) -> Option<MethodSig> {
        let params = ty
            .params
            .iter()
            .map(|param| self.lookup(param).cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(MethodSig {
            params,
            ret: self.lookup(&ty.ret)?.clone(),
            variadic: ty.variadic,
        })
    }

    /// Registry entry of a named or literal aggregate type.
    pub fn aggregate(&self, ty: &ir::Type) -> Option<&AggregateEntry> {
        match self.lookup(ty)? {
            TypeSig::Record(id) => self.registry.entry(*id),
            _ => None,
        }
    }

    pub fn registry(&self) -> &AggregateRegistry {
        &self.registry
    }

    pub fn records(&self) -> Vec<RecordDef> {
        self.registry.records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_ir::{ModuleBuilder, Type};

    #[test]
    fn resolution_is_memoized() {
        let mut builder = ModuleBuilder::new("m");
        let point = builder.add_struct("struct.Point", vec![Type::i32(), Type::i32()]);
        let module = builder.finish();

        let mut resolver = TypeResolver::new();
        let first = resolver.resolve(&point, &module).unwrap();
        let second = resolver.resolve(&point, &module).unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.registry().len(), 1);
        assert_eq!(resolver.lookup(&point), Some(&first));
    }

    #[test]
    fn self_referential_aggregate_terminates() {
        let mut builder = ModuleBuilder::new("m");
        let node = builder.add_struct(
            "struct.Node",
            vec![Type::i32(), Type::array(Type::Pointer, 2)],
        );
        let module = builder.finish();
        let mut resolver = TypeResolver::new();
        let sig = resolver.resolve(&node, &module).unwrap();
        let records = resolver.records();
        assert_eq!(sig, TypeSig::Record(ib_bytecode::RecordId(0)));
        assert_eq!(records[0].name, "Node");
        assert_eq!(records[0].fields[1].name, "field_1");
    }

    #[test]
    fn identical_layouts_with_different_names_do_not_alias() {
        let mut builder = ModuleBuilder::new("m");
        let a = builder.add_struct("struct.A", vec![Type::i64()]);
        let b = builder.add_struct("struct.B", vec![Type::i64()]);
        let module = builder.finish();
        let mut resolver = TypeResolver::new();
        let a_sig = resolver.resolve(&a, &module).unwrap();
        let b_sig = resolver.resolve(&b, &module).unwrap();
        assert_ne!(a_sig, b_sig);
    }

    #[test]
    fn scalar_mapping() {
        let module = ir::Module::new("m");
        let mut resolver = TypeResolver::new();
        assert_eq!(resolver.resolve(&Type::i1(), &module).unwrap(), TypeSig::Bool);
        assert_eq!(
            resolver.resolve(&Type::Int(24), &module).unwrap(),
            TypeSig::Int(IntWidth::I32)
        );
        assert_eq!(
            resolver.resolve(&Type::Pointer, &module).unwrap(),
            TypeSig::opaque_pointer()
        );
        assert!(resolver.resolve(&Type::Int(256), &module).is_err());
    }
}
