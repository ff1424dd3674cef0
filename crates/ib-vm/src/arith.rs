use crate::value::{round_float, Pointer, Value};
use crate::VmError;
use ib_bytecode::{BinaryOp, CompareOp, FloatKind, IntWidth, NumKind, UnaryOp};

fn mask(width: IntWidth) -> u128 {
    match width {
        IntWidth::I128 => u128::MAX,
        width => (1u128 << width.bits()) - 1,
    }
}

fn unsigned(width: IntWidth, value: i128) -> u128 {
    (value as u128) & mask(width)
}

fn int_operand(value: &Value, op: &str) -> Result<i128, VmError> {
    value.as_i128().ok_or_else(|| VmError::Runtime {
        message: format!("{} expects an integer operand, got {:?}", op, value),
    })
}

fn float_operand(value: &Value, op: &str) -> Result<f64, VmError> {
    value.as_f64().ok_or_else(|| VmError::Runtime {
        message: format!("{} expects a float operand, got {:?}", op, value),
    })
}

fn bool_operand(value: &Value, op: &str) -> Result<bool, VmError> {
    match value {
        Value::Bool(value) => Ok(*value),
        Value::Int { value, .. } => Ok(*value & 1 != 0),
        other => Err(VmError::Runtime {
            message: format!("{} expects a bool operand, got {:?}", op, other),
        }),
    }
}

fn divisor(width: IntWidth, value: i128) -> Result<i128, VmError> {
    if unsigned(width, value) == 0 {
        return Err(VmError::Runtime {
            message: "integer division by zero".to_string(),
        });
    }
    Ok(value)
}

pub fn eval_binary(op: BinaryOp, kind: NumKind, left: Value, right: Value) -> Result<Value, VmError> {
    match kind {
        NumKind::Int(width) => {
            let a = int_operand(&left, "binary op")?;
            let b = int_operand(&right, "binary op")?;
            let shift = (unsigned(width, b) % u128::from(width.bits())) as u32;
            let value = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div => a.wrapping_div(divisor(width, b)?),
                BinaryOp::Rem => a.wrapping_rem(divisor(width, b)?),
                BinaryOp::DivUn => {
                    (unsigned(width, a) / unsigned(width, divisor(width, b)?)) as i128
                }
                BinaryOp::RemUn => {
                    (unsigned(width, a) % unsigned(width, divisor(width, b)?)) as i128
                }
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
                BinaryOp::Shl => a.wrapping_shl(shift),
                BinaryOp::Shr => a >> shift,
                BinaryOp::ShrUn => (unsigned(width, a) >> shift) as i128,
            };
            Ok(Value::int(width, value))
        }
        NumKind::Bool => {
            let a = bool_operand(&left, "binary op")?;
            let b = bool_operand(&right, "binary op")?;
            let value = match op {
                BinaryOp::And | BinaryOp::Mul => a && b,
                BinaryOp::Or => a || b,
                BinaryOp::Xor | BinaryOp::Add | BinaryOp::Sub => a ^ b,
                _ => {
                    return Err(VmError::Unsupported {
                        message: format!("binary op {:?} on bool", op),
                    })
                }
            };
            Ok(Value::Bool(value))
        }
        NumKind::Float(float) => {
            let a = float_operand(&left, "binary op")?;
            let b = float_operand(&right, "binary op")?;
            let value = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                _ => {
                    return Err(VmError::Unsupported {
                        message: format!("binary op {:?} on floats", op),
                    })
                }
            };
            Ok(Value::Float {
                kind: float,
                value: round_float(float, value),
            })
        }
        NumKind::Pointer => Err(VmError::Unsupported {
            message: format!("binary op {:?} on pointers", op),
        }),
    }
}

pub fn eval_unary(op: UnaryOp, kind: NumKind, value: Value) -> Result<Value, VmError> {
    match (op, kind) {
        (UnaryOp::LogicalNot, _) => {
            let truth = value.is_truthy().ok_or_else(|| VmError::Runtime {
                message: format!("logical not of {:?}", value),
            })?;
            Ok(Value::Bool(!truth))
        }
        (UnaryOp::Neg, NumKind::Int(width)) => {
            Ok(Value::int(width, int_operand(&value, "neg")?.wrapping_neg()))
        }
        (UnaryOp::Not, NumKind::Int(width)) => Ok(Value::int(width, !int_operand(&value, "not")?)),
        (UnaryOp::Neg, NumKind::Float(float)) => Ok(Value::Float {
            kind: float,
            value: -float_operand(&value, "neg")?,
        }),
        (UnaryOp::Not | UnaryOp::Neg, NumKind::Bool) => {
            // negating an i1 flips it just like not
            Ok(Value::Bool(!bool_operand(&value, "not")?))
        }
        _ => Err(VmError::Unsupported {
            message: format!("unary op {:?} on {:?}", op, kind),
        }),
    }
}

/// Integer `GtUn`/`LtUn` are unsigned; on floats they are true when unordered, while
/// the plain relations are false when unordered.
pub fn eval_compare(op: CompareOp, kind: NumKind, left: Value, right: Value) -> Result<bool, VmError> {
    match kind {
        NumKind::Int(width) => {
            let a = int_operand(&left, "compare")?;
            let b = int_operand(&right, "compare")?;
            Ok(match op {
                CompareOp::Eq => a == b,
                CompareOp::Gt => a > b,
                CompareOp::Lt => a < b,
                CompareOp::GtUn => unsigned(width, a) > unsigned(width, b),
                CompareOp::LtUn => unsigned(width, a) < unsigned(width, b),
            })
        }
        // a set bit is -1 under the signed relations
        NumKind::Bool => {
            let a = bool_operand(&left, "compare")?;
            let b = bool_operand(&right, "compare")?;
            let signed = |bit: bool| -i8::from(bit);
            Ok(match op {
                CompareOp::Eq => a == b,
                CompareOp::Gt => signed(a) > signed(b),
                CompareOp::Lt => signed(a) < signed(b),
                CompareOp::GtUn => a & !b,
                CompareOp::LtUn => !a & b,
            })
        }
        NumKind::Float(_) => {
            let a = float_operand(&left, "compare")?;
            let b = float_operand(&right, "compare")?;
            Ok(match op {
                CompareOp::Eq => a == b,
                CompareOp::Gt => a > b,
                CompareOp::Lt => a < b,
                CompareOp::GtUn => !(a <= b),
                CompareOp::LtUn => !(a >= b),
            })
        }
        NumKind::Pointer => compare_pointers(op, &left, &right),
    }
}

fn compare_pointers(op: CompareOp, left: &Value, right: &Value) -> Result<bool, VmError> {
    if op == CompareOp::Eq {
        return Ok(left == right);
    }
    match (left, right) {
        (
            Value::Pointer(Pointer::Memory {
                region: a,
                offset: x,
            }),
            Value::Pointer(Pointer::Memory {
                region: b,
                offset: y,
            }),
        ) if a == b => Ok(match op {
            CompareOp::Gt | CompareOp::GtUn => x > y,
            _ => x < y,
        }),
        _ => Err(VmError::Unsupported {
            message: format!("ordering of unrelated pointers {:?} and {:?}", left, right),
        }),
    }
}

pub fn eval_convert(from: NumKind, to: NumKind, signed: bool, value: Value) -> Result<Value, VmError> {
    let converted = match (from, to) {
        (NumKind::Int(source), NumKind::Int(target)) => {
            let raw = int_operand(&value, "convert")?;
            let widened = if signed {
                raw
            } else {
                unsigned(source, raw) as i128
            };
            Value::int(target, widened)
        }
        (NumKind::Bool, NumKind::Int(target)) => {
            let bit = bool_operand(&value, "convert")?;
            let widened = match (bit, signed) {
                (false, _) => 0,
                (true, true) => -1,
                (true, false) => 1,
            };
            Value::int(target, widened)
        }
        (NumKind::Int(_), NumKind::Bool) => Value::Bool(int_operand(&value, "convert")? & 1 != 0),
        (NumKind::Bool, NumKind::Bool) => Value::Bool(bool_operand(&value, "convert")?),
        (NumKind::Int(source), NumKind::Float(target)) => {
            let raw = int_operand(&value, "convert")?;
            let number = if signed {
                raw as f64
            } else {
                unsigned(source, raw) as f64
            };
            Value::Float {
                kind: target,
                value: round_float(target, number),
            }
        }
        (NumKind::Bool, NumKind::Float(target)) => {
            let bit = bool_operand(&value, "convert")?;
            let number = match (bit, signed) {
                (false, _) => 0.0,
                (true, true) => -1.0,
                (true, false) => 1.0,
            };
            Value::Float {
                kind: target,
                value: number,
            }
        }
        (NumKind::Float(_), NumKind::Int(target)) => {
            let number = float_operand(&value, "convert")?;
            let raw = if signed {
                number as i128
            } else {
                number as u128 as i128
            };
            Value::int(target, raw)
        }
        (NumKind::Float(_), NumKind::Bool) => Value::Bool(float_operand(&value, "convert")? != 0.0),
        (NumKind::Float(_), NumKind::Float(target)) => Value::Float {
            kind: target,
            value: round_float(target, float_operand(&value, "convert")?),
        },
        (NumKind::Pointer, NumKind::Pointer) => value,
        (NumKind::Pointer, NumKind::Int(target)) => match value {
            Value::Null => Value::int(target, 0),
            other => {
                return Err(VmError::Unsupported {
                    message: format!("pointer {:?} has no integer representation", other),
                })
            }
        },
        (NumKind::Int(_), NumKind::Pointer) => match int_operand(&value, "convert")? {
            0 => Value::Null,
            address => {
                return Err(VmError::Unsupported {
                    message: format!("integer {} cannot be used as an address", address),
                })
            }
        },
        _ => {
            return Err(VmError::Unsupported {
                message: format!("conversion from {:?} to {:?}", from, to),
            })
        }
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const I8: NumKind = NumKind::Int(IntWidth::I8);
    const F64: NumKind = NumKind::Float(FloatKind::Double);

    #[test]
    fn integer_add_wraps_at_width() {
        let sum = eval_binary(
            BinaryOp::Add,
            I8,
            Value::int(IntWidth::I8, 127),
            Value::int(IntWidth::I8, 1),
        )
        .unwrap();
        assert_eq!(sum, Value::int(IntWidth::I8, -128));
    }

    #[test]
    fn unsigned_division_reads_bits_unsigned() {
        let quotient = eval_binary(
            BinaryOp::DivUn,
            I8,
            Value::int(IntWidth::I8, -2),
            Value::int(IntWidth::I8, 2),
        )
        .unwrap();
        assert_eq!(quotient, Value::int(IntWidth::I8, 127));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = eval_binary(BinaryOp::Div, I8, Value::int(IntWidth::I8, 1), Value::int(IntWidth::I8, 0))
            .unwrap_err();
        assert!(matches!(err, VmError::Runtime { .. }));
    }

    #[test]
    fn signed_bool_compares_treat_true_as_minus_one() {
        let compare = |op, a, b| eval_compare(op, NumKind::Bool, Value::Bool(a), Value::Bool(b)).unwrap();
        assert!(compare(CompareOp::Lt, true, false));
        assert!(!compare(CompareOp::Gt, true, false));
        assert!(compare(CompareOp::GtUn, true, false));
        assert!(!compare(CompareOp::LtUn, true, false));
        assert!(!compare(CompareOp::Lt, true, true));
    }

    #[test]
    fn unordered_float_compares() {
        let nan = || Value::double(f64::NAN);
        let one = || Value::double(1.0);
        assert!(!eval_compare(CompareOp::Eq, F64, nan(), nan()).unwrap());
        assert!(!eval_compare(CompareOp::Gt, F64, nan(), one()).unwrap());
        assert!(!eval_compare(CompareOp::Lt, F64, nan(), one()).unwrap());
        assert!(eval_compare(CompareOp::GtUn, F64, nan(), one()).unwrap());
        assert!(eval_compare(CompareOp::LtUn, F64, one(), nan()).unwrap());
        assert!(!eval_compare(CompareOp::LtUn, F64, one(), Value::double(0.5)).unwrap());
    }

    #[test]
    fn unsigned_int_compare() {
        let minus_one = Value::int(IntWidth::I8, -1);
        let one = Value::int(IntWidth::I8, 1);
        assert!(eval_compare(CompareOp::GtUn, I8, minus_one.clone(), one.clone()).unwrap());
        assert!(!eval_compare(CompareOp::Gt, I8, minus_one, one).unwrap());
    }

    #[test]
    fn zero_and_sign_extension() {
        let byte = Value::int(IntWidth::I8, -1);
        let zext = eval_convert(I8, NumKind::Int(IntWidth::I32), false, byte.clone()).unwrap();
        let sext = eval_convert(I8, NumKind::Int(IntWidth::I32), true, byte).unwrap();
        assert_eq!(zext, Value::i32(255));
        assert_eq!(sext, Value::i32(-1));
    }
}
