use crate::{Const, Op, RecordId, TargetModule, TypeSig, Visibility};
use itertools::Itertools;

pub fn format_module(module: &TargetModule) -> String {
    let mut output = String::new();
    output.push_str(&format!("module {} {{\n", module.name));
    output.push_str("  const_pool:\n");
    for (index, constant) in module.const_pool.iter().enumerate() {
        output.push_str(&format!(
            "    [{}] {}\n",
            index,
            format_const(module, constant)
        ));
    }
    for record in &module.records {
        output.push_str(&format!("  record {} ({})", record.name, record.mangled_name));
        if record.packed {
            output.push_str(" packed");
        }
        output.push_str(" {\n");
        for field in &record.fields {
            output.push_str(&format!(
                "    {}: {}\n",
                field.name,
                format_type(module, &field.ty)
            ));
        }
        output.push_str("  }\n");
    }
    for (index, item) in module.statics.iter().enumerate() {
        output.push_str(&format!(
            "  static [{}] {}: {}\n",
            index,
            item.name,
            format_type(module, &item.ty)
        ));
    }
    for method in &module.methods {
        let visibility = match method.visibility {
            Visibility::Public => "public",
            Visibility::Internal => "internal",
        };
        let mut params = method
            .parameter_names
            .iter()
            .zip(&method.signature.params)
            .map(|(name, ty)| format!("{}: {}", name, format_type(module, ty)))
            .collect_vec();
        if method.signature.variadic {
            params.push("...".to_string());
        }
        output.push_str(&format!(
            "  {} method {}({}) -> {}\n",
            visibility,
            method.name,
            params.join(", "),
            format_type(module, &method.signature.ret)
        ));
        for (index, local) in method.body.locals.iter().enumerate() {
            output.push_str(&format!(
                "    local {}: {}\n",
                index,
                format_type(module, local)
            ));
        }
        for region in &method.body.regions {
            output.push_str(&format!(
                "    try L{}..L{} catch L{}..L{}\n",
                region.try_start.0, region.try_end.0, region.handler_start.0, region.handler_end.0
            ));
        }
        for op in &method.body.ops {
            match op {
                Op::Label(label) => output.push_str(&format!("   L{}:\n", label.0)),
                other => output.push_str(&format!("      {}\n", format_op(module, other))),
            }
        }
    }
    output.push_str("}\n");
    output
}

fn record_name(module: &TargetModule, id: RecordId) -> String {
    module
        .record(id)
        .map(|record| record.name.clone())
        .unwrap_or_else(|| format!("record#{}", id.0))
}

pub(crate) fn format_type(module: &TargetModule, ty: &TypeSig) -> String {
    match ty {
        TypeSig::Void => "void".to_string(),
        TypeSig::Bool => "bool".to_string(),
        TypeSig::Int(width) => format!("int{}", width.bits()),
        TypeSig::Half => "half".to_string(),
        TypeSig::Single => "float32".to_string(),
        TypeSig::Double => "float64".to_string(),
        TypeSig::Pointer(pointee) => format!("{}*", format_type(module, pointee)),
        TypeSig::Array(elem, len) => format!("{}[{}]", format_type(module, elem), len),
        TypeSig::Record(id) => record_name(module, *id),
        TypeSig::VarArgs => "varargs".to_string(),
    }
}

fn format_const(module: &TargetModule, value: &Const) -> String {
    match value {
        Const::Bool(value) => value.to_string(),
        Const::Int { width, value } => format!("int{} {}", width.bits(), value),
        Const::Float { value, .. } => format!("{:?}", value),
        Const::Null => "null".to_string(),
        Const::Default(ty) => format!("default({})", format_type(module, ty)),
    }
}

fn format_op(module: &TargetModule, op: &Op) -> String {
    match op {
        Op::Label(label) => format!("L{}:", label.0),
        Op::Nop => "nop".to_string(),
        Op::LoadConst(id) => format!("ldc [{}]", id),
        Op::LoadArg(index) => format!("ldarg {}", index),
        Op::LoadLocal(index) => format!("ldloc {}", index),
        Op::StoreLocal(index) => format!("stloc {}", index),
        Op::LoadLocalAddress(index) => format!("ldloca {}", index),
        Op::InitLocal(index) => format!("initloc {}", index),
        Op::LoadStaticAddress(index) => format!("ldsflda {}", index),
        Op::LoadMethodPointer(index) => match module.methods.get(*index as usize) {
            Some(method) => format!("ldftn {}", method.name),
            None => format!("ldftn #{}", index),
        },
        Op::LoadIndirect(ty) => format!("ldind {}", format_type(module, ty)),
        Op::StoreIndirect(ty) => format!("stind {}", format_type(module, ty)),
        Op::FieldAddress { record, field } => {
            format!("ldflda {}::field_{}", record_name(module, *record), field)
        }
        Op::ElementAddress(ty) => format!("ldelema {}", format_type(module, ty)),
        Op::Binary { op, kind } => format!("{:?}.{:?}", op, kind).to_lowercase(),
        Op::Unary { op, kind } => format!("{:?}.{:?}", op, kind).to_lowercase(),
        Op::Compare { op, kind } => format!("c{:?}.{:?}", op, kind).to_lowercase(),
        Op::Convert { from, to, signed } => {
            let sign = if *signed { "s" } else { "u" };
            format!("conv.{} {:?} -> {:?}", sign, from, to).to_lowercase()
        }
        Op::Call { method, arg_count } => match module.methods.get(*method as usize) {
            Some(def) => format!("call {}({})", def.name, arg_count),
            None => format!("call #{}({})", method, arg_count),
        },
        Op::CallIndirect { arg_count, .. } => format!("calli ({})", arg_count),
        Op::CallRuntime { entry, arg_count } => format!("call {}({})", entry, arg_count),
        Op::PackVarArgs(count) => format!("pack.varargs {}", count),
        Op::NextVarArg(ty) => format!("next.vararg {}", format_type(module, ty)),
        Op::Dup => "dup".to_string(),
        Op::Pop => "pop".to_string(),
        Op::Branch(label) => format!("br L{}", label.0),
        Op::BranchTrue(label) => format!("brtrue L{}", label.0),
        Op::BranchFalse(label) => format!("brfalse L{}", label.0),
        Op::SwitchValue { cases, default } => {
            let cases = cases
                .iter()
                .map(|(value, label)| format!("{} => L{}", value, label.0))
                .join(", ");
            format!("switch [{}] else L{}", cases, default.0)
        }
        Op::Leave(label) => format!("leave L{}", label.0),
        Op::Return => "ret".to_string(),
        Op::Throw => "throw".to_string(),
        Op::Unreachable => "unreachable".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, IntWidth, RecordDef};

    #[test]
    fn lists_records_with_positional_fields() {
        let mut module = TargetModule::new("m");
        module.records.push(RecordDef {
            name: "Point".to_string(),
            mangled_name: "struct.Point".to_string(),
            fields: vec![
                FieldDef {
                    name: "field_0".to_string(),
                    ty: TypeSig::Int(IntWidth::I32),
                },
                FieldDef {
                    name: "field_1".to_string(),
                    ty: TypeSig::pointer_to(TypeSig::Record(RecordId(0))),
                },
            ],
            packed: false,
        });
        let text = format_module(&module);
        assert!(text.contains("record Point (struct.Point) {"));
        assert!(text.contains("field_1: Point*"));
    }
}
