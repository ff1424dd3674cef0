use crate::instruction::{InstrInfo, Instruction};
use crate::ty::{FunctionType, Type};
use crate::value::{BlockId, Constant, Operand, ValueId};
use itertools::Itertools;
use std::fmt::{Display, Formatter};

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{}", bits),
            Type::Half => write!(f, "half"),
            Type::Float => write!(f, "float"),
            Type::Double => write!(f, "double"),
            Type::Pointer => write!(f, "ptr"),
            Type::Array(elem, len) => write!(f, "[{} x {}]", len, elem),
            Type::Vector(elem, len) => write!(f, "<{} x {}>", len, elem),
            Type::Struct(name) => write!(f, "%{}", name),
            Type::Literal { fields, packed } => {
                let body = fields.iter().join(", ");
                if *packed {
                    write!(f, "<{{ {} }}>", body)
                } else {
                    write!(f, "{{ {} }}", body)
                }
            }
            Type::Function(ty) => write!(f, "{}", ty),
            Type::Label => write!(f, "label"),
            Type::Token => write!(f, "token"),
            Type::Metadata => write!(f, "metadata"),
        }
    }
}

impl Display for FunctionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut params = self.params.iter().map(ToString::to_string).collect_vec();
        if self.variadic {
            params.push("...".to_string());
        }
        write!(f, "{} ({})", self.ret, params.join(", "))
    }
}

impl Display for ValueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl Display for Constant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Int { ty, value } => write!(f, "{} {}", ty, value),
            Constant::Float { ty, value } => write!(f, "{} {:?}", ty, value),
            Constant::Null => write!(f, "ptr null"),
            Constant::Undef(ty) => write!(f, "{} undef", ty),
            Constant::Poison(ty) => write!(f, "{} poison", ty),
            Constant::Zero(ty) => write!(f, "{} zeroinitializer", ty),
            Constant::NoneToken => write!(f, "none"),
        }
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Value(id) => write!(f, "{}", id),
            Operand::Const(constant) => write!(f, "{}", constant),
            Operand::Expr(expr) => write!(
                f,
                "{} ({})",
                expr.opcode,
                expr.operands.iter().join(", ")
            ),
            Operand::Block(id) => write!(f, "label {}", id),
            Operand::Global(name) | Operand::Function(name) => write!(f, "@{}", name),
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if !self.ty.is_void() {
            write!(f, "{} = ", self.id)?;
        }
        write!(f, "{}", self.opcode)?;
        if let Some(code) = self.predicate() {
            write!(f, " #{}", code)?;
        }
        match &self.info {
            InstrInfo::Phi { incoming_blocks } => {
                let pairs = self
                    .operands
                    .iter()
                    .zip(incoming_blocks)
                    .map(|(value, block)| format!("[ {}, {} ]", value, block))
                    .join(", ");
                write!(f, " {} {}", self.ty, pairs)
            }
            InstrInfo::Alloca { allocated } => write!(f, " {}", allocated),
            _ => {
                if !self.operands.is_empty() {
                    write!(f, " {}", self.operands.iter().join(", "))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{predicate, Opcode};

    #[test]
    fn formats_types_and_instructions() {
        let ty = Type::Literal {
            fields: vec![Type::i32(), Type::array(Type::Double, 4)],
            packed: false,
        };
        assert_eq!(ty.to_string(), "{ i32, [4 x double] }");

        let inst = Instruction::new(
            ValueId(3),
            Opcode::ICmp,
            Type::i1(),
            vec![Operand::Value(ValueId(1)), Operand::int(32, 7)],
        )
        .with_info(InstrInfo::Predicate(predicate::ICMP_SLT));
        assert_eq!(inst.to_string(), "%3 = icmp #40 %1, i32 7");
    }
}
