//! Host reference implementations and result checking.
//!
//! Each catalogue entry computes what the method must return under Java
//! semantics: wrapping integer arithmetic, shift counts masked to the operand
//! width, saturating float-to-integer conversion with NaN mapped to zero.
//! NaN results follow the ARM floating-point rules so they compare bit-exactly
//! against simulated code: an operand NaN propagates (signaling NaNs first,
//! quieted), otherwise the default NaN `0x7fc00000` / `0x7ff8000000000000`.

use crate::abi::{self, FloatReg, ReturnSlot};
use crate::error::CapturedOutput;
use crate::isa::Isa;
use crate::kind::{Kind, Signature, Value};
use crate::sim::regdump::RegisterSnapshot;
use serde::Serialize;
use std::sync::OnceLock;
use thiserror::Error;

/// A tested operation.
pub struct Operation {
    pub name: &'static str,
    pub params: &'static [Kind],
    pub ret: Kind,
    reference: fn(&[Value]) -> Value,
    /// Built-in vectors, one comma-separated literal list each
    pub vectors: &'static [&'static str],
}

#[derive(Debug, Error, PartialEq)]
pub enum OracleError {
    #[error("`{name}` takes {expected} arguments, got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("argument {index} of `{name}` must be {expected}, got {actual}")]
    KindMismatch {
        name: String,
        index: usize,
        expected: Kind,
        actual: Kind,
    },
}

impl Operation {
    pub fn signature(&self) -> Signature {
        Signature::new(self.params.to_vec(), self.ret)
    }

    /// Compute the expected result for one vector.
    pub fn evaluate(&self, args: &[Value]) -> Result<Value, OracleError> {
        if args.len() != self.params.len() {
            return Err(OracleError::Arity {
                name: self.name.to_string(),
                expected: self.params.len(),
                actual: args.len(),
            });
        }
        for (index, (arg, kind)) in args.iter().zip(self.params).enumerate() {
            if arg.kind() != *kind {
                return Err(OracleError::KindMismatch {
                    name: self.name.to_string(),
                    index,
                    expected: *kind,
                    actual: arg.kind(),
                });
            }
        }
        Ok((self.reference)(args))
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("signature", &self.signature().to_string())
            .finish()
    }
}

const II: &[Kind] = &[Kind::Int, Kind::Int];
const LL: &[Kind] = &[Kind::Long, Kind::Long];
const LI: &[Kind] = &[Kind::Long, Kind::Int];
const FF: &[Kind] = &[Kind::Float, Kind::Float];
const DD: &[Kind] = &[Kind::Double, Kind::Double];
const I: &[Kind] = &[Kind::Int];
const L: &[Kind] = &[Kind::Long];
const F: &[Kind] = &[Kind::Float];
const D: &[Kind] = &[Kind::Double];

const INT_LOGIC: &[&str] = &["0x0f0f0f0f, 0x00ff00ff", "-1, 12345", "0, -1"];
const LONG_LOGIC: &[&str] = &["0xff00ff00ff00ff00, 0x0ff00ff00ff00ff0", "-1, 0", "0x8000000000000001, -1"];
const FLOAT_ARITH: &[&str] = &[
    "1.5, 2.25",
    "NaN, 1.0",
    "inf, -inf",
    "-0.0, 0.0",
    "3.4028235e38, 3.4028235e38",
];
const FLOAT_DIV: &[&str] = &["1.0, 3.0", "1.0, 0.0", "0.0, 0.0", "-1.0, 0.0", "-0.0, inf"];
const DOUBLE_ARITH: &[&str] = &[
    "1.5, 2.25",
    "NaN, 1.0",
    "inf, -inf",
    "-0.0, 0.0",
    "1.7976931348623157e308, 1.7976931348623157e308",
];

fn int2(args: &[Value], f: fn(i32, i32) -> i32) -> Value {
    Value::Int(f(args[0].as_i32(), args[1].as_i32()))
}

fn long2(args: &[Value], f: fn(i64, i64) -> i64) -> Value {
    Value::Long(f(args[0].as_i64(), args[1].as_i64()))
}

fn float2(args: &[Value], f: fn(f32, f32) -> f32) -> Value {
    let (a, b) = (args[0].as_f32(), args[1].as_f32());
    Value::Float(process_nan_f32(f(a, b), &[a, b]))
}

fn double2(args: &[Value], f: fn(f64, f64) -> f64) -> Value {
    let (a, b) = (args[0].as_f64(), args[1].as_f64());
    Value::Double(process_nan_f64(f(a, b), &[a, b]))
}

const F32_QUIET: u32 = 1 << 22;
const F64_QUIET: u64 = 1 << 51;
pub const DEFAULT_NAN_F32: u32 = 0x7fc0_0000;
pub const DEFAULT_NAN_F64: u64 = 0x7ff8_0000_0000_0000;

fn process_nan_f32(result: f32, operands: &[f32]) -> f32 {
    if !result.is_nan() {
        return result;
    }
    let signaling = operands
        .iter()
        .find(|v| v.is_nan() && v.to_bits() & F32_QUIET == 0);
    match signaling.or_else(|| operands.iter().find(|v| v.is_nan())) {
        Some(nan) => f32::from_bits(nan.to_bits() | F32_QUIET),
        None => f32::from_bits(DEFAULT_NAN_F32),
    }
}

fn process_nan_f64(result: f64, operands: &[f64]) -> f64 {
    if !result.is_nan() {
        return result;
    }
    let signaling = operands
        .iter()
        .find(|v| v.is_nan() && v.to_bits() & F64_QUIET == 0);
    match signaling.or_else(|| operands.iter().find(|v| v.is_nan())) {
        Some(nan) => f64::from_bits(nan.to_bits() | F64_QUIET),
        None => f64::from_bits(DEFAULT_NAN_F64),
    }
}

/// Single to double; a NaN keeps its sign and payload and becomes quiet.
fn widen(v: f32) -> f64 {
    if !v.is_nan() {
        return v as f64;
    }
    let bits = v.to_bits() as u64;
    let sign = (bits >> 31) << 63;
    let payload = (bits & 0x007f_ffff) << 29;
    f64::from_bits(sign | 0x7ff0_0000_0000_0000 | payload | F64_QUIET)
}

/// Double to single; a NaN keeps its sign and the top of its payload.
fn narrow(v: f64) -> f32 {
    if !v.is_nan() {
        return v as f32;
    }
    let bits = v.to_bits();
    let sign = ((bits >> 63) as u32) << 31;
    let payload = ((bits & 0x000f_ffff_ffff_ffff) >> 29) as u32;
    f32::from_bits(sign | 0x7f80_0000 | payload | F32_QUIET)
}

fn build_catalogue() -> Vec<Operation> {
    use Kind::*;
    vec![
        Operation {
            name: "iadd",
            params: II,
            ret: Int,
            reference: |a| int2(a, i32::wrapping_add),
            vectors: &["1, 2", "2147483647, 1", "-2147483648, -1", "0, 0"],
        },
        Operation {
            name: "isub",
            params: II,
            ret: Int,
            reference: |a| int2(a, i32::wrapping_sub),
            vectors: &["1, 2", "-2147483648, 1", "0, -2147483648"],
        },
        Operation {
            name: "imul",
            params: II,
            ret: Int,
            reference: |a| int2(a, i32::wrapping_mul),
            vectors: &["6, 7", "65536, 65536", "-2147483648, -1", "2147483647, 2"],
        },
        Operation {
            name: "iand",
            params: II,
            ret: Int,
            reference: |a| int2(a, |x, y| x & y),
            vectors: INT_LOGIC,
        },
        Operation {
            name: "ior",
            params: II,
            ret: Int,
            reference: |a| int2(a, |x, y| x | y),
            vectors: INT_LOGIC,
        },
        Operation {
            name: "ixor",
            params: II,
            ret: Int,
            reference: |a| int2(a, |x, y| x ^ y),
            vectors: INT_LOGIC,
        },
        Operation {
            name: "ishl",
            params: II,
            ret: Int,
            reference: |a| int2(a, |x, y| x.wrapping_shl(y as u32)),
            vectors: &["1, 31", "1, 32", "3, -1", "0x12345678, 4"],
        },
        Operation {
            name: "ishr",
            params: II,
            ret: Int,
            reference: |a| int2(a, |x, y| x.wrapping_shr(y as u32)),
            vectors: &["-8, 1", "-2147483648, 31", "16, 33", "-1, -1"],
        },
        Operation {
            name: "iushr",
            params: II,
            ret: Int,
            reference: |a| int2(a, |x, y| (x as u32).wrapping_shr(y as u32) as i32),
            vectors: &["-8, 1", "-1, 28", "16, -30"],
        },
        Operation {
            name: "ineg",
            params: I,
            ret: Int,
            reference: |a| Value::Int(a[0].as_i32().wrapping_neg()),
            vectors: &["0", "1", "-2147483648"],
        },
        Operation {
            name: "ladd",
            params: LL,
            ret: Long,
            reference: |a| long2(a, i64::wrapping_add),
            vectors: &[
                "1, 2",
                "9223372036854775807, 1",
                "-1, -1",
                "0x00000000ffffffff, 1",
            ],
        },
        Operation {
            name: "lsub",
            params: LL,
            ret: Long,
            reference: |a| long2(a, i64::wrapping_sub),
            vectors: &["0, 1", "-9223372036854775808, 1", "4294967296, 1"],
        },
        Operation {
            name: "lmul",
            params: LL,
            ret: Long,
            reference: |a| long2(a, i64::wrapping_mul),
            vectors: &[
                "4294967296, 4294967296",
                "-1, -9223372036854775808",
                "123456789, 987654321",
            ],
        },
        Operation {
            name: "land",
            params: LL,
            ret: Long,
            reference: |a| long2(a, |x, y| x & y),
            vectors: LONG_LOGIC,
        },
        Operation {
            name: "lor",
            params: LL,
            ret: Long,
            reference: |a| long2(a, |x, y| x | y),
            vectors: LONG_LOGIC,
        },
        Operation {
            name: "lxor",
            params: LL,
            ret: Long,
            reference: |a| long2(a, |x, y| x ^ y),
            vectors: LONG_LOGIC,
        },
        Operation {
            name: "lshl",
            params: LI,
            ret: Long,
            reference: |a| Value::Long(a[0].as_i64().wrapping_shl(a[1].as_i32() as u32)),
            vectors: &["1, 63", "1, 64", "5, -1", "0x0000000080000000, 1"],
        },
        Operation {
            name: "lshr",
            params: LI,
            ret: Long,
            reference: |a| Value::Long(a[0].as_i64().wrapping_shr(a[1].as_i32() as u32)),
            vectors: &["-9223372036854775808, 63", "-16, 2", "256, -60"],
        },
        Operation {
            name: "lushr",
            params: LI,
            ret: Long,
            reference: |a| {
                Value::Long((a[0].as_i64() as u64).wrapping_shr(a[1].as_i32() as u32) as i64)
            },
            vectors: &["-1, 1", "-9223372036854775808, 63", "-1, -1"],
        },
        Operation {
            name: "lneg",
            params: L,
            ret: Long,
            reference: |a| Value::Long(a[0].as_i64().wrapping_neg()),
            vectors: &["0", "-9223372036854775808", "4294967296"],
        },
        Operation {
            name: "i2l",
            params: I,
            ret: Long,
            reference: |a| Value::Long(a[0].as_i32() as i64),
            vectors: &["-1", "2147483647", "-2147483648"],
        },
        Operation {
            name: "l2i",
            params: L,
            ret: Int,
            reference: |a| Value::Int(a[0].as_i64() as i32),
            vectors: &["4294967297", "-1", "0x7fffffff80000000"],
        },
        Operation {
            name: "i2b",
            params: I,
            ret: Byte,
            reference: |a| Value::Byte(a[0].as_i32() as i8),
            vectors: &["127", "128", "-129", "0x12345680"],
        },
        Operation {
            name: "i2s",
            params: I,
            ret: Short,
            reference: |a| Value::Short(a[0].as_i32() as i16),
            vectors: &["32767", "32768", "-32769"],
        },
        Operation {
            name: "i2c",
            params: I,
            ret: Char,
            reference: |a| Value::Char(a[0].as_i32() as u16),
            vectors: &["-1", "65536", "65", "0x12345678"],
        },
        Operation {
            name: "i2f",
            params: I,
            ret: Float,
            reference: |a| Value::Float(a[0].as_i32() as f32),
            vectors: &["16777217", "-2147483648", "0"],
        },
        Operation {
            name: "i2d",
            params: I,
            ret: Double,
            reference: |a| Value::Double(a[0].as_i32() as f64),
            vectors: &["2147483647", "-1"],
        },
        Operation {
            name: "l2f",
            params: L,
            ret: Float,
            reference: |a| Value::Float(a[0].as_i64() as f32),
            vectors: &["9223372036854775807", "-1", "16777217"],
        },
        Operation {
            name: "l2d",
            params: L,
            ret: Double,
            reference: |a| Value::Double(a[0].as_i64() as f64),
            vectors: &["9007199254740993", "-9223372036854775808"],
        },
        Operation {
            name: "f2i",
            params: F,
            ret: Int,
            reference: |a| Value::Int(a[0].as_f32() as i32),
            vectors: &["1.5", "-1.5", "NaN", "inf", "-inf", "3e10"],
        },
        Operation {
            name: "f2l",
            params: F,
            ret: Long,
            reference: |a| Value::Long(a[0].as_f32() as i64),
            vectors: &["NaN", "1e19", "-1e19", "-0.0"],
        },
        Operation {
            name: "d2i",
            params: D,
            ret: Int,
            reference: |a| Value::Int(a[0].as_f64() as i32),
            vectors: &["NaN", "2147483648.0", "-2147483649.0", "-0.9"],
        },
        Operation {
            name: "d2l",
            params: D,
            ret: Long,
            reference: |a| Value::Long(a[0].as_f64() as i64),
            vectors: &["NaN", "inf", "9.3e18", "-2.5"],
        },
        Operation {
            name: "f2d",
            params: F,
            ret: Double,
            reference: |a| Value::Double(widen(a[0].as_f32())),
            vectors: &["1.1", "NaN", "-0.0", "inf"],
        },
        Operation {
            name: "d2f",
            params: D,
            ret: Float,
            reference: |a| Value::Float(narrow(a[0].as_f64())),
            vectors: &["1.1", "1e300", "-0.0", "NaN", "1e-50"],
        },
        Operation {
            name: "fadd",
            params: FF,
            ret: Float,
            reference: |a| float2(a, |x, y| x + y),
            vectors: FLOAT_ARITH,
        },
        Operation {
            name: "fsub",
            params: FF,
            ret: Float,
            reference: |a| float2(a, |x, y| x - y),
            vectors: FLOAT_ARITH,
        },
        Operation {
            name: "fmul",
            params: FF,
            ret: Float,
            reference: |a| float2(a, |x, y| x * y),
            vectors: &["1.5, 2.25", "0.0, inf", "-0.0, 5.0", "1e20, 1e20"],
        },
        Operation {
            name: "fdiv",
            params: FF,
            ret: Float,
            reference: |a| float2(a, |x, y| x / y),
            vectors: FLOAT_DIV,
        },
        Operation {
            name: "fneg",
            params: F,
            ret: Float,
            reference: |a| Value::Float(-a[0].as_f32()),
            vectors: &["0.0", "NaN", "-inf", "1.5"],
        },
        Operation {
            name: "dadd",
            params: DD,
            ret: Double,
            reference: |a| double2(a, |x, y| x + y),
            vectors: DOUBLE_ARITH,
        },
        Operation {
            name: "dsub",
            params: DD,
            ret: Double,
            reference: |a| double2(a, |x, y| x - y),
            vectors: DOUBLE_ARITH,
        },
        Operation {
            name: "dmul",
            params: DD,
            ret: Double,
            reference: |a| double2(a, |x, y| x * y),
            vectors: &["1.5, 2.25", "0.0, inf", "-0.0, 5.0", "1e200, 1e200"],
        },
        Operation {
            name: "ddiv",
            params: DD,
            ret: Double,
            reference: |a| double2(a, |x, y| x / y),
            vectors: FLOAT_DIV,
        },
        Operation {
            name: "dneg",
            params: D,
            ret: Double,
            reference: |a| Value::Double(-a[0].as_f64()),
            vectors: &["0.0", "NaN", "-inf", "1.5"],
        },
        Operation {
            name: "invokestatic",
            params: II,
            ret: Int,
            // helper(a, b) + 1 with helper(a, b) = a * b
            reference: |a| int2(a, |x, y| x.wrapping_mul(y).wrapping_add(1)),
            vectors: &["6, 7", "65536, 65536", "-1, 1"],
        },
    ]
}

/// Every operation with a host reference.
pub fn catalogue() -> &'static [Operation] {
    static CATALOGUE: OnceLock<Vec<Operation>> = OnceLock::new();
    CATALOGUE.get_or_init(build_catalogue)
}

pub fn lookup(name: &str) -> Option<&'static Operation> {
    catalogue().iter().find(|op| op.name == name)
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("register {0} missing from the dump")]
    MissingRegister(String),
    #[error("void methods return nothing to compare")]
    Void,
}

/// Recover the method's return value from the captured registers.
///
/// A sub-int result that is not the canonical 32-bit widening of its kind is
/// decoded as a plain `int`, so it never compares equal to the expected value.
pub fn decode_return(
    isa: Isa,
    kind: Kind,
    snapshot: &RegisterSnapshot,
) -> Result<Value, DecodeError> {
    let int_reg = |index: u8| {
        snapshot
            .integer(index as usize)
            .ok_or_else(|| DecodeError::MissingRegister(integer_name(isa, index)))
    };
    let float_reg = |index: u8| {
        snapshot
            .float(index as usize)
            .ok_or_else(|| DecodeError::MissingRegister(format!("d{}", index)))
    };

    let value = match abi::return_slot(isa, kind) {
        ReturnSlot::None => return Err(DecodeError::Void),
        ReturnSlot::GprPair { lo, hi } => Value::Long(abi::join_long(int_reg(lo)?, int_reg(hi)?)),
        ReturnSlot::Gpr(index) => {
            let raw = int_reg(index)?;
            let word = raw as u32;
            match kind {
                Kind::Long => Value::Long(raw as i64),
                Kind::Reference if isa.pointer_size() == 8 => Value::Reference(raw),
                Kind::Reference => Value::Reference(word as u64),
                Kind::Int => Value::Int(word as i32),
                Kind::Boolean if word <= 1 => Value::Boolean(word == 1),
                Kind::Byte if word as i32 == word as i8 as i32 => Value::Byte(word as i8),
                Kind::Short if word as i32 == word as i16 as i32 => Value::Short(word as i16),
                Kind::Char if word <= 0xffff => Value::Char(word as u16),
                _ => Value::Int(word as i32),
            }
        }
        ReturnSlot::Fpr(FloatReg::S(index)) => Value::Float(f32::from_bits(float_reg(index)? as u32)),
        ReturnSlot::Fpr(FloatReg::D(index)) => Value::Double(f64::from_bits(float_reg(index)?)),
    };
    Ok(value)
}

fn integer_name(isa: Isa, index: u8) -> String {
    isa.integer_registers()
        .get(index as usize)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("#{}", index))
}

/// Outcome of one test vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail {
        expected: Value,
        actual: Value,
    },
    /// The vector could not be executed or its result could not be read
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        dump: Option<String>,
        /// What the failing tool printed
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<CapturedOutput>,
    },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Compare the simulated result bit-exactly against the host value.
pub fn check(expected: &Value, snapshot: &RegisterSnapshot, kind: Kind, isa: Isa) -> Verdict {
    match decode_return(isa, kind, snapshot) {
        Ok(actual) if actual.bit_eq(expected) => Verdict::Pass,
        Ok(actual) => Verdict::Fail {
            expected: *expected,
            actual,
        },
        Err(e) => Verdict::Error {
            message: e.to_string(),
            dump: Some(snapshot.raw.clone()),
            output: None,
        },
    }
}
