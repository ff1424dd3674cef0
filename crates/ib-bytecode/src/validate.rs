use crate::builder::op_targets;
use crate::{BytecodeError, LabelId, MethodBody, MethodDef, Op, Result, TargetModule};
use std::collections::HashMap;

pub fn validate_module(module: &TargetModule) -> Result<()> {
    for method in &module.methods {
        validate_method(module, method)?;
    }
    Ok(())
}

/// Op index of each marked label.
pub fn label_positions(body: &MethodBody) -> HashMap<LabelId, usize> {
    body.ops
        .iter()
        .enumerate()
        .filter_map(|(index, op)| match op {
            Op::Label(label) => Some((*label, index)),
            _ => None,
        })
        .collect()
}

pub fn validate_method(module: &TargetModule, method: &MethodDef) -> Result<()> {
    let invalid = |message: String| BytecodeError::Invalid {
        method: method.name.clone(),
        message,
    };
    let body = &method.body;
    let positions = label_positions(body);
    let locals_len = body.locals.len();
    let args_len = method.signature.arg_slots();

    for op in &body.ops {
        if let Op::Label(label) = op {
            if label.0 >= body.label_count {
                return Err(invalid(format!("label L{} out of range", label.0)));
            }
        }
        for target in op_targets(op) {
            if !positions.contains_key(&target) {
                return Err(invalid(format!("branch to unmarked label L{}", target.0)));
            }
        }
        match op {
            Op::LoadConst(id) if *id as usize >= module.const_pool.len() => {
                return Err(invalid(format!("const id {} out of bounds", id)));
            }
            Op::LoadLocal(local)
            | Op::StoreLocal(local)
            | Op::LoadLocalAddress(local)
            | Op::InitLocal(local)
                if *local as usize >= locals_len =>
            {
                return Err(invalid(format!("local {} out of bounds", local)));
            }
            Op::LoadArg(arg) if *arg as usize >= args_len => {
                return Err(invalid(format!("argument {} out of bounds", arg)));
            }
            Op::LoadStaticAddress(id) if *id as usize >= module.statics.len() => {
                return Err(invalid(format!("static {} out of bounds", id)));
            }
            Op::LoadMethodPointer(id) if *id as usize >= module.methods.len() => {
                return Err(invalid(format!("method {} out of bounds", id)));
            }
            Op::FieldAddress { record, field } => {
                let Some(def) = module.record(*record) else {
                    return Err(invalid(format!("record {} out of bounds", record.0)));
                };
                if *field as usize >= def.fields.len() {
                    return Err(invalid(format!(
                        "record {} has no field {}",
                        def.name, field
                    )));
                }
            }
            Op::Call { method: callee, arg_count } => {
                let Some(def) = module.methods.get(*callee as usize) else {
                    return Err(invalid(format!("method {} out of bounds", callee)));
                };
                if def.signature.arg_slots() != *arg_count as usize {
                    return Err(invalid(format!(
                        "call to {} passes {} arguments, expected {}",
                        def.name,
                        arg_count,
                        def.signature.arg_slots()
                    )));
                }
            }
            Op::CallRuntime { entry, arg_count } if entry.arity() != *arg_count => {
                return Err(invalid(format!(
                    "runtime call {} passes {} arguments, expected {}",
                    entry,
                    arg_count,
                    entry.arity()
                )));
            }
            _ => {}
        }
    }

    validate_regions(body, &positions).map_err(invalid)
}

fn validate_regions(
    body: &MethodBody,
    positions: &HashMap<LabelId, usize>,
) -> std::result::Result<(), String> {
    let position = |label: LabelId| {
        positions
            .get(&label)
            .copied()
            .ok_or_else(|| format!("region boundary L{} never marked", label.0))
    };

    let mut ranges = Vec::with_capacity(body.regions.len() * 2);
    for (index, region) in body.regions.iter().enumerate() {
        let protected = (position(region.try_start)?, position(region.try_end)?);
        let handler = (position(region.handler_start)?, position(region.handler_end)?);
        if protected.0 > protected.1 || handler.0 > handler.1 {
            return Err(format!("region {} has inverted bounds", index));
        }
        if overlaps(protected, handler) {
            return Err(format!("region {} handler overlaps its protected range", index));
        }
        ranges.push((index, protected));
        ranges.push((index, handler));
    }

    for (i, (owner_a, a)) in ranges.iter().enumerate() {
        for (owner_b, b) in ranges.iter().skip(i + 1) {
            if owner_a == owner_b {
                continue;
            }
            let disjoint = !overlaps(*a, *b);
            let nested = contains(*a, *b) || contains(*b, *a);
            if !disjoint && !nested {
                return Err(format!(
                    "regions {} and {} are not well nested",
                    owner_a, owner_b
                ));
            }
        }
    }
    Ok(())
}

fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn contains(outer: (usize, usize), inner: (usize, usize)) -> bool {
    outer.0 <= inner.0 && inner.1 <= outer.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MethodBodyBuilder, MethodSig, TypeSig, Visibility};

    fn method_with(body: MethodBody) -> MethodDef {
        MethodDef {
            name: "m".to_string(),
            mangled_name: "m".to_string(),
            visibility: Visibility::Internal,
            signature: MethodSig {
                params: vec![],
                ret: TypeSig::Void,
                variadic: false,
            },
            parameter_names: vec![],
            body,
        }
    }

    #[test]
    fn crossing_regions_are_rejected() {
        let mut builder = MethodBodyBuilder::new();
        let labels: Vec<_> = (0..8).map(|_| builder.new_label()).collect();
        for label in &labels {
            builder.mark_label(*label);
            builder.emit(Op::Nop);
        }
        builder.emit(Op::Return);
        // [0,2) handler [5,6) crosses [1,3) handler [6,7)
        builder.add_region(labels[0], labels[2], labels[5], labels[6]);
        builder.add_region(labels[1], labels[3], labels[6], labels[7]);
        let body = builder.finish().expect("labels");
        let module = TargetModule::new("t");
        let err = validate_method(&module, &method_with(body)).unwrap_err();
        assert!(err.to_string().contains("not well nested"));
    }

    #[test]
    fn nested_regions_are_accepted() {
        let mut builder = MethodBodyBuilder::new();
        let labels: Vec<_> = (0..8).map(|_| builder.new_label()).collect();
        for label in &labels {
            builder.mark_label(*label);
            builder.emit(Op::Nop);
        }
        builder.emit(Op::Return);
        builder.add_region(labels[0], labels[4], labels[5], labels[7]);
        builder.add_region(labels[1], labels[2], labels[2], labels[3]);
        let body = builder.finish().expect("labels");
        let module = TargetModule::new("t");
        validate_method(&module, &method_with(body)).expect("well nested");
    }

    #[test]
    fn local_out_of_bounds_is_rejected() {
        let mut builder = MethodBodyBuilder::new();
        builder.emit(Op::LoadLocal(3));
        builder.emit(Op::Return);
        let body = builder.finish().expect("labels");
        let module = TargetModule::new("t");
        assert!(validate_method(&module, &method_with(body)).is_err());
    }
}
