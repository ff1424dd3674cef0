use crate::{BytecodeError, ExceptionRegion, LabelId, MethodBody, Op, RegionKind, Result, TypeSig};
use std::collections::HashSet;

/// Incrementally assembles a [`MethodBody`]. Labels may be referenced before they are marked.
#[derive(Debug, Default)]
pub struct MethodBodyBuilder {
    locals: Vec<TypeSig>,
    ops: Vec<Op>,
    regions: Vec<ExceptionRegion>,
    label_count: u32,
    marked: HashSet<LabelId>,
}

impl MethodBodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> LabelId {
        let label = LabelId(self.label_count);
        self.label_count += 1;
        label
    }

    pub fn mark_label(&mut self, label: LabelId) {
        self.marked.insert(label);
        self.ops.push(Op::Label(label));
    }

    pub fn add_local(&mut self, ty: TypeSig) -> u32 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u32
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = Op>) {
        self.ops.extend(ops);
    }

    pub fn add_region(
        &mut self,
        try_start: LabelId,
        try_end: LabelId,
        handler_start: LabelId,
        handler_end: LabelId,
    ) {
        self.regions.push(ExceptionRegion {
            try_start,
            try_end,
            handler_start,
            handler_end,
            kind: RegionKind::Catch,
        });
    }

    /// Checks that every referenced label was marked exactly once.
    pub fn finish(self) -> Result<MethodBody> {
        let mut seen = HashSet::new();
        for op in &self.ops {
            if let Op::Label(label) = op {
                if !seen.insert(*label) {
                    return Err(BytecodeError::Format {
                        message: format!("label L{} marked twice", label.0),
                    });
                }
            }
        }
        let referenced = self.ops.iter().flat_map(op_targets).chain(
            self.regions.iter().flat_map(|region| {
                [
                    region.try_start,
                    region.try_end,
                    region.handler_start,
                    region.handler_end,
                ]
            }),
        );
        for label in referenced {
            if !self.marked.contains(&label) {
                return Err(BytecodeError::Format {
                    message: format!("label L{} referenced but never marked", label.0),
                });
            }
        }
        Ok(MethodBody {
            locals: self.locals,
            ops: self.ops,
            regions: self.regions,
            label_count: self.label_count,
        })
    }
}

/// Labels an op may transfer control to.
pub fn op_targets(op: &Op) -> Vec<LabelId> {
    match op {
        Op::Branch(label) | Op::BranchTrue(label) | Op::BranchFalse(label) | Op::Leave(label) => {
            vec![*label]
        }
        Op::SwitchValue { cases, default } => cases
            .iter()
            .map(|(_, label)| *label)
            .chain(std::iter::once(*default))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_labels_resolve() {
        let mut builder = MethodBodyBuilder::new();
        let exit = builder.new_label();
        builder.emit(Op::Branch(exit));
        builder.mark_label(exit);
        builder.emit(Op::Return);
        let body = builder.finish().expect("body");
        assert_eq!(body.label_count, 1);
        assert_eq!(body.ops.len(), 3);
    }

    #[test]
    fn unmarked_label_is_rejected() {
        let mut builder = MethodBodyBuilder::new();
        let exit = builder.new_label();
        builder.emit(Op::Branch(exit));
        assert!(builder.finish().is_err());
    }
}
