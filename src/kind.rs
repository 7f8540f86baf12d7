//! Value kinds, typed literals and method signatures.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The kind of a parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
    /// Only valid as a return kind.
    Void,
}

/// Register class a kind travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterClass {
    /// One 32-bit general register word (sub-int kinds are widened).
    Word,
    /// A 64-bit integer: a register pair on 32-bit targets.
    DoubleWord,
    /// Address-sized general register.
    Address,
    Single,
    Double,
    None,
}

impl Kind {
    pub const fn register_class(self) -> RegisterClass {
        match self {
            Kind::Boolean | Kind::Byte | Kind::Char | Kind::Short | Kind::Int => RegisterClass::Word,
            Kind::Long => RegisterClass::DoubleWord,
            Kind::Reference => RegisterClass::Address,
            Kind::Float => RegisterClass::Single,
            Kind::Double => RegisterClass::Double,
            Kind::Void => RegisterClass::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Boolean => "boolean",
            Kind::Byte => "byte",
            Kind::Char => "char",
            Kind::Short => "short",
            Kind::Int => "int",
            Kind::Long => "long",
            Kind::Float => "float",
            Kind::Double => "double",
            Kind::Reference => "reference",
            Kind::Void => "void",
        }
    }

    /// Parse a type name. Class names and array types are references.
    pub fn from_type_name(name: &str) -> Option<Kind> {
        let kind = match name {
            "boolean" => Kind::Boolean,
            "byte" => Kind::Byte,
            "char" => Kind::Char,
            "short" => Kind::Short,
            "int" => Kind::Int,
            "long" => Kind::Long,
            "float" => Kind::Float,
            "double" => Kind::Double,
            "void" => Kind::Void,
            "reference" => Kind::Reference,
            other if other.ends_with("[]") => Kind::Reference,
            other if is_class_name(other) => Kind::Reference,
            _ => return None,
        };
        Some(kind)
    }
}

/// `Object`, `java.lang.String`, `Outer$Inner`: the simple name is capitalized.
fn is_class_name(name: &str) -> bool {
    let simple = name.rsplit('.').next().unwrap_or(name);
    simple.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '$'))
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("cannot parse `{text}` as {kind}")]
    Parse { kind: Kind, text: String },
    #[error("{text} does not fit in {kind}")]
    OutOfRange { kind: Kind, text: String },
    #[error("void has no values")]
    Void,
}

/// A typed literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Reference(u64),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Boolean(_) => Kind::Boolean,
            Value::Byte(_) => Kind::Byte,
            Value::Char(_) => Kind::Char,
            Value::Short(_) => Kind::Short,
            Value::Int(_) => Kind::Int,
            Value::Long(_) => Kind::Long,
            Value::Float(_) => Kind::Float,
            Value::Double(_) => Kind::Double,
            Value::Reference(_) => Kind::Reference,
        }
    }

    /// The canonical raw bit pattern: sub-int kinds widened to a 32-bit word,
    /// floats as their IEEE-754 encoding.
    pub fn raw_bits(&self) -> u64 {
        match *self {
            Value::Boolean(b) => b as u64,
            Value::Byte(v) => v as i32 as u32 as u64,
            Value::Char(v) => v as u64,
            Value::Short(v) => v as i32 as u32 as u64,
            Value::Int(v) => v as u32 as u64,
            Value::Long(v) => v as u64,
            Value::Float(v) => v.to_bits() as u64,
            Value::Double(v) => v.to_bits(),
            Value::Reference(v) => v,
        }
    }

    /// Sign- or zero-extension of the value to 64 bits, as held in a 64-bit register.
    pub fn extended_bits(&self) -> u64 {
        match *self {
            Value::Byte(v) => v as i64 as u64,
            Value::Short(v) => v as i64 as u64,
            Value::Int(v) => v as i64 as u64,
            _ => self.raw_bits(),
        }
    }

    /// Bitwise equality: same kind and identical bit pattern (NaN equals NaN).
    pub fn bit_eq(&self, other: &Value) -> bool {
        self.kind() == other.kind() && self.raw_bits() == other.raw_bits()
    }

    pub fn as_i32(&self) -> i32 {
        match *self {
            Value::Boolean(b) => b as i32,
            Value::Byte(v) => v as i32,
            Value::Char(v) => v as i32,
            Value::Short(v) => v as i32,
            Value::Int(v) => v,
            Value::Long(v) => v as i32,
            Value::Float(v) => v as i32,
            Value::Double(v) => v as i32,
            Value::Reference(v) => v as i32,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            Value::Long(v) => v,
            Value::Float(v) => v as i64,
            Value::Double(v) => v as i64,
            Value::Reference(v) => v as i64,
            _ => self.as_i32() as i64,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match *self {
            Value::Float(v) => v,
            Value::Double(v) => v as f32,
            Value::Long(v) => v as f32,
            _ => self.as_i32() as f32,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Float(v) => v as f64,
            Value::Double(v) => v,
            Value::Long(v) => v as f64,
            _ => self.as_i32() as f64,
        }
    }

    /// Parse a literal of the given kind. Integers accept decimal or `0x` hex
    /// (hex is read as a raw bit pattern); floats accept `NaN`, `inf` and `-inf`.
    pub fn parse(kind: Kind, text: &str) -> Result<Value, ValueError> {
        let text = text.trim();
        let parse_err = || ValueError::Parse {
            kind,
            text: text.to_string(),
        };
        let range_err = || ValueError::OutOfRange {
            kind,
            text: text.to_string(),
        };
        match kind {
            Kind::Void => Err(ValueError::Void),
            Kind::Boolean => match text {
                "true" | "1" => Ok(Value::Boolean(true)),
                "false" | "0" => Ok(Value::Boolean(false)),
                _ => Err(parse_err()),
            },
            Kind::Float => {
                if let Some(bits) = parse_hex(text) {
                    let bits = u32::try_from(bits).map_err(|_| range_err())?;
                    return Ok(Value::Float(f32::from_bits(bits)));
                }
                match parse_float(text) {
                    Some(v) if v.is_nan() => Ok(Value::Float(f32::NAN)),
                    Some(v) => Ok(Value::Float(v as f32)),
                    None => Err(parse_err()),
                }
            }
            Kind::Double => {
                if let Some(bits) = parse_hex(text) {
                    return Ok(Value::Double(f64::from_bits(bits)));
                }
                parse_float(text).map(Value::Double).ok_or_else(parse_err)
            }
            Kind::Reference => parse_hex(text)
                .or_else(|| text.parse::<u64>().ok())
                .map(Value::Reference)
                .ok_or_else(parse_err),
            Kind::Long => {
                if let Some(bits) = parse_hex(text) {
                    return Ok(Value::Long(bits as i64));
                }
                text.parse::<i64>().map(Value::Long).map_err(|_| parse_err())
            }
            Kind::Int | Kind::Short | Kind::Byte | Kind::Char => {
                let wide = match parse_hex(text) {
                    Some(bits) => {
                        let word = u32::try_from(bits).map_err(|_| range_err())?;
                        word as i32 as i64
                    }
                    None => text.parse::<i64>().map_err(|_| parse_err())?,
                };
                Value::from_integer(kind, wide).ok_or_else(range_err)
            }
        }
    }

    /// Convert a TOML literal from a suite file.
    pub fn from_toml(kind: Kind, literal: &toml::Value) -> Result<Value, ValueError> {
        let parse_err = || ValueError::Parse {
            kind,
            text: literal.to_string(),
        };
        match literal {
            toml::Value::String(text) => Value::parse(kind, text),
            toml::Value::Boolean(b) if kind == Kind::Boolean => Ok(Value::Boolean(*b)),
            toml::Value::Integer(i) => match kind {
                Kind::Float => Ok(Value::Float(*i as f32)),
                Kind::Double => Ok(Value::Double(*i as f64)),
                Kind::Boolean => Value::parse(kind, &i.to_string()),
                Kind::Reference => u64::try_from(*i)
                    .map(Value::Reference)
                    .map_err(|_| parse_err()),
                Kind::Void => Err(ValueError::Void),
                _ => Value::from_integer(kind, *i).ok_or_else(|| ValueError::OutOfRange {
                    kind,
                    text: i.to_string(),
                }),
            },
            toml::Value::Float(v) => match kind {
                Kind::Float => Ok(Value::Float(*v as f32)),
                Kind::Double => Ok(Value::Double(*v)),
                _ => Err(parse_err()),
            },
            _ => Err(parse_err()),
        }
    }

    fn from_integer(kind: Kind, v: i64) -> Option<Value> {
        match kind {
            Kind::Byte => i8::try_from(v).ok().map(Value::Byte),
            Kind::Char => u16::try_from(v).ok().map(Value::Char),
            Kind::Short => i16::try_from(v).ok().map(Value::Short),
            Kind::Int => i32::try_from(v).ok().map(Value::Int),
            Kind::Long => Some(Value::Long(v)),
            _ => None,
        }
    }
}

fn parse_hex(text: &str) -> Option<u64> {
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;
    u64::from_str_radix(&digits.replace('_', ""), 16).ok()
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" | "nan" => Some(f64::NAN),
        "inf" | "+inf" | "Infinity" => Some(f64::INFINITY),
        "-inf" | "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.trim_end_matches(['f', 'F', 'd', 'D']).parse().ok(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}L", v),
            Value::Float(v) if v.is_nan() => write!(f, "NaN(0x{:08x})", v.to_bits()),
            Value::Float(v) => write!(f, "{:?}f", v),
            Value::Double(v) if v.is_nan() => write!(f, "NaN(0x{:016x})", v.to_bits()),
            Value::Double(v) => write!(f, "{:?}", v),
            Value::Reference(v) => write!(f, "@0x{:x}", v),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("malformed signature `{0}`: expected `<return> [name](<params>)`")]
    Malformed(String),
    #[error("unknown type `{name}` in signature `{signature}`")]
    UnknownType { name: String, signature: String },
}

/// Parameter kinds plus a return kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Kind>,
    pub ret: Kind,
}

impl Signature {
    pub fn new(params: Vec<Kind>, ret: Kind) -> Self {
        Self { params, ret }
    }

    /// Parse a descriptor such as `long test(long, int)`; the method name is optional.
    pub fn parse(text: &str) -> Result<Signature, SignatureError> {
        let malformed = || SignatureError::Malformed(text.to_string());
        let open = text.find('(').ok_or_else(malformed)?;
        let close = text.rfind(')').ok_or_else(malformed)?;
        if close < open || !text[close + 1..].trim().is_empty() {
            return Err(malformed());
        }

        let head: Vec<&str> = text[..open].split_whitespace().collect();
        if head.is_empty() || head.len() > 2 {
            return Err(malformed());
        }
        let lookup = |name: &str| {
            Kind::from_type_name(name).ok_or_else(|| SignatureError::UnknownType {
                name: name.to_string(),
                signature: text.to_string(),
            })
        };
        let ret = lookup(head[0])?;

        let inner = text[open + 1..close].trim();
        let params = if inner.is_empty() {
            Vec::new()
        } else {
            inner
                .split(',')
                .map(|p| {
                    // Allow `int a` as well as `int`.
                    let ty = p.split_whitespace().next().unwrap_or("");
                    lookup(ty)
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Signature { params, ret })
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signature::parse(s)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", p)?;
        }
        f.write_str(")")
    }
}

/// One set of literal arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestVector {
    pub args: Vec<Value>,
}

impl TestVector {
    pub fn new(args: Vec<Value>) -> Self {
        Self { args }
    }

    /// Parse comma-separated literals against a signature's parameter kinds.
    pub fn parse(signature: &Signature, text: &str) -> Result<TestVector, ValueError> {
        let parts: Vec<&str> = if text.trim().is_empty() {
            Vec::new()
        } else {
            text.split(',').collect()
        };
        let args = parts
            .iter()
            .zip(signature.params.iter().chain(std::iter::repeat(&Kind::Int)))
            .map(|(part, kind)| Value::parse(*kind, part))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TestVector { args })
    }
}
