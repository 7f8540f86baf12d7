//! Test suites.
//!
//! A suite file lists operations and their vectors:
//!
//! ```toml
//! [[operation]]
//! name = "iadd"
//! vectors = ["2147483647, 1", [-1, 1]]
//!
//! [[operation]]
//! name = "twice"
//! signature = "int twice(int)"
//! vectors = [[21]]
//! expected = [42]
//! ```
//!
//! Catalogue operations take their signature and expected values from the
//! host oracle; anything else must spell out both.

use crate::kind::{Signature, SignatureError, TestVector, Value, ValueError};
use crate::oracle::{self, Operation, OracleError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse suite: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("operation `{name}`: {source}")]
    Signature {
        name: String,
        #[source]
        source: SignatureError,
    },
    #[error("operation `{name}` declares `{declared}` but the oracle computes `{oracle}`")]
    SignatureMismatch {
        name: String,
        declared: String,
        oracle: String,
    },
    #[error("operation `{name}` vector {index}: {source}")]
    Value {
        name: String,
        index: usize,
        #[source]
        source: ValueError,
    },
    #[error("operation `{name}` vector {index}: expected {expected} arguments, got {actual}")]
    Arity {
        name: String,
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("operation `{0}` has no host oracle; give `signature` and `expected`")]
    NoOracle(String),
    #[error("operation `{name}` has {vectors} vectors but {expected} expected values")]
    ExpectedCount {
        name: String,
        vectors: usize,
        expected: usize,
    },
    #[error("no operation named `{0}` in the suite")]
    UnknownOperation(String),
}

#[derive(Debug, Deserialize)]
struct SuiteFile {
    #[serde(default, rename = "operation")]
    operations: Vec<OperationEntry>,
}

#[derive(Debug, Deserialize)]
struct OperationEntry {
    name: String,
    signature: Option<String>,
    #[serde(default)]
    vectors: Vec<toml::Value>,
    expected: Option<Vec<toml::Value>>,
}

/// Where a vector's expected value comes from.
#[derive(Debug)]
pub enum Expectation {
    Oracle(&'static Operation),
    Values(Vec<Value>),
}

/// One operation with its vectors.
#[derive(Debug)]
pub struct SuiteOperation {
    pub name: String,
    pub signature: Signature,
    pub vectors: Vec<TestVector>,
    pub expectation: Expectation,
}

impl SuiteOperation {
    /// Expected result of vector `index`.
    pub fn expected(&self, index: usize) -> Result<Value, OracleError> {
        match &self.expectation {
            Expectation::Oracle(op) => op.evaluate(&self.vectors[index].args),
            Expectation::Values(values) => Ok(values[index]),
        }
    }
}

#[derive(Debug, Default)]
pub struct Suite {
    pub operations: Vec<SuiteOperation>,
}

impl Suite {
    /// Every catalogue operation with its built-in vectors.
    pub fn builtin() -> Result<Suite, SuiteError> {
        let operations = oracle::catalogue()
            .iter()
            .map(|op| {
                let signature = op.signature();
                let vectors = op
                    .vectors
                    .iter()
                    .enumerate()
                    .map(|(index, text)| {
                        TestVector::parse(&signature, text).map_err(|source| SuiteError::Value {
                            name: op.name.to_string(),
                            index,
                            source,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SuiteOperation {
                    name: op.name.to_string(),
                    signature,
                    vectors,
                    expectation: Expectation::Oracle(op),
                })
            })
            .collect::<Result<Vec<_>, SuiteError>>()?;
        Ok(Suite { operations })
    }

    pub fn load(path: &Path) -> Result<Suite, SuiteError> {
        let content = fs::read_to_string(path).map_err(|source| SuiteError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Suite, SuiteError> {
        let file: SuiteFile = toml::from_str(content)?;
        let operations = file
            .operations
            .into_iter()
            .map(build_operation)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Suite { operations })
    }

    /// Keep only the named operations, in suite order.
    pub fn retain_named(&mut self, names: &[String]) -> Result<(), SuiteError> {
        if let Some(missing) = names
            .iter()
            .find(|name| !self.operations.iter().any(|op| &op.name == *name))
        {
            return Err(SuiteError::UnknownOperation(missing.clone()));
        }
        if !names.is_empty() {
            self.operations.retain(|op| names.contains(&op.name));
        }
        Ok(())
    }

    pub fn vector_count(&self) -> usize {
        self.operations.iter().map(|op| op.vectors.len()).sum()
    }
}

fn build_operation(entry: OperationEntry) -> Result<SuiteOperation, SuiteError> {
    let oracle_op = oracle::lookup(&entry.name);
    let declared = entry
        .signature
        .as_deref()
        .map(Signature::parse)
        .transpose()
        .map_err(|source| SuiteError::Signature {
            name: entry.name.clone(),
            source,
        })?;

    let signature = match (oracle_op, declared) {
        (Some(op), Some(declared)) if declared != op.signature() => {
            return Err(SuiteError::SignatureMismatch {
                name: entry.name,
                declared: declared.to_string(),
                oracle: op.signature().to_string(),
            });
        }
        (_, Some(declared)) => declared,
        (Some(op), None) => op.signature(),
        (None, None) => return Err(SuiteError::NoOracle(entry.name)),
    };

    let vectors = entry
        .vectors
        .iter()
        .enumerate()
        .map(|(index, literal)| parse_vector(&entry.name, index, &signature, literal))
        .collect::<Result<Vec<_>, _>>()?;

    let expectation = match (entry.expected, oracle_op) {
        (Some(expected), _) => {
            if expected.len() != vectors.len() {
                return Err(SuiteError::ExpectedCount {
                    name: entry.name,
                    vectors: vectors.len(),
                    expected: expected.len(),
                });
            }
            let values = expected
                .iter()
                .enumerate()
                .map(|(index, literal)| {
                    Value::from_toml(signature.ret, literal).map_err(|source| SuiteError::Value {
                        name: entry.name.clone(),
                        index,
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Expectation::Values(values)
        }
        (None, Some(op)) => Expectation::Oracle(op),
        (None, None) => return Err(SuiteError::NoOracle(entry.name)),
    };

    Ok(SuiteOperation {
        name: entry.name,
        signature,
        vectors,
        expectation,
    })
}

fn parse_vector(
    name: &str,
    index: usize,
    signature: &Signature,
    literal: &toml::Value,
) -> Result<TestVector, SuiteError> {
    let value_err = |source| SuiteError::Value {
        name: name.to_string(),
        index,
        source,
    };
    let arity = |actual| SuiteError::Arity {
        name: name.to_string(),
        index,
        expected: signature.params.len(),
        actual,
    };

    let vector = match literal {
        toml::Value::String(text) => TestVector::parse(signature, text).map_err(value_err)?,
        toml::Value::Array(items) => {
            if items.len() != signature.params.len() {
                return Err(arity(items.len()));
            }
            let args = items
                .iter()
                .zip(&signature.params)
                .map(|(item, kind)| Value::from_toml(*kind, item))
                .collect::<Result<Vec<_>, _>>()
                .map_err(value_err)?;
            TestVector::new(args)
        }
        scalar => match signature.params.as_slice() {
            [kind] => TestVector::new(vec![Value::from_toml(*kind, scalar).map_err(value_err)?]),
            _ => return Err(arity(1)),
        },
    };
    if vector.args.len() != signature.params.len() {
        return Err(arity(vector.args.len()));
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_suite_covers_catalogue() {
        let suite = Suite::builtin().unwrap();
        assert_eq!(suite.operations.len(), oracle::catalogue().len());
        assert!(suite.vector_count() > 100);
        let iadd = &suite.operations[0];
        assert_eq!(iadd.name, "iadd");
        assert_eq!(iadd.expected(1).unwrap(), Value::Int(i32::MIN));
    }

    #[test]
    fn test_load_mixed_vectors() {
        let suite = Suite::from_toml_str(
            r#"
[[operation]]
name = "iadd"
vectors = ["2147483647, 1", [-1, 1]]

[[operation]]
name = "twice"
signature = "int twice(int)"
vectors = [[21], 4]
expected = [42, 8]
"#,
        )
        .unwrap();
        assert_eq!(suite.operations.len(), 2);
        assert_eq!(suite.operations[0].vectors[1].args, vec![Value::Int(-1), Value::Int(1)]);
        assert_eq!(suite.operations[0].expected(1).unwrap(), Value::Int(0));
        assert_eq!(suite.operations[1].expected(0).unwrap(), Value::Int(42));
        assert_eq!(suite.operations[1].vectors[1].args, vec![Value::Int(4)]);
    }

    #[test]
    fn test_suite_errors() {
        let no_oracle = "[[operation]]\nname = \"mystery\"\nvectors = [[1]]";
        assert!(matches!(
            Suite::from_toml_str(no_oracle),
            Err(SuiteError::NoOracle(_))
        ));

        let mismatch = "[[operation]]\nname = \"iadd\"\nsignature = \"long (long, long)\"";
        assert!(matches!(
            Suite::from_toml_str(mismatch),
            Err(SuiteError::SignatureMismatch { .. })
        ));

        let arity = "[[operation]]\nname = \"iadd\"\nvectors = [[1]]";
        assert!(matches!(
            Suite::from_toml_str(arity),
            Err(SuiteError::Arity { .. })
        ));

        let count = "[[operation]]\nname = \"iadd\"\nvectors = [[1, 2]]\nexpected = []";
        assert!(matches!(
            Suite::from_toml_str(count),
            Err(SuiteError::ExpectedCount { .. })
        ));
    }

    #[test]
    fn test_retain_named() {
        let mut suite = Suite::builtin().unwrap();
        suite
            .retain_named(&["lshl".to_string(), "iadd".to_string()])
            .unwrap();
        let names: Vec<&str> = suite.operations.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, vec!["iadd", "lshl"]);

        assert!(matches!(
            suite.retain_named(&["nope".to_string()]),
            Err(SuiteError::UnknownOperation(_))
        ));
    }
}
