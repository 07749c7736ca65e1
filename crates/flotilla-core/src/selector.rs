//! Label selectors for constraining job placement.
//!
//! A [`Selector`] is a conjunction of [`Requirement`]s over node labels,
//! supporting equality, set membership and existence operators. Selectors are
//! pure values: parsing and matching never touch cluster state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// The operator of a single label requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// The label must equal the single value.
    Equals,
    /// The label must exist and differ from the single value.
    NotEquals,
    /// The label must be one of the values.
    In,
    /// The label must be absent or not one of the values.
    NotIn,
    /// The label must exist, regardless of value.
    Exists,
    /// The label must be absent.
    DoesNotExist,
}

/// A single requirement over one label key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// The label key the requirement applies to.
    pub key: String,
    /// The comparison operator.
    pub operator: Operator,
    /// Operand values; empty for existence operators.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Requirement {
    /// Creates a requirement.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the key is blank, when an existence
    /// operator carries values, or when a value operator carries none
    /// (or more than one, for the equality operators).
    pub fn new(key: impl Into<String>, operator: Operator, values: Vec<String>) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(Error::validation("label requirement key must not be blank"));
        }
        match operator {
            Operator::Equals | Operator::NotEquals => {
                if values.len() != 1 {
                    return Err(Error::validation(format!(
                        "operator {operator:?} requires exactly one value, got {}",
                        values.len()
                    )));
                }
            }
            Operator::In | Operator::NotIn => {
                if values.is_empty() {
                    return Err(Error::validation(format!(
                        "operator {operator:?} requires at least one value"
                    )));
                }
            }
            Operator::Exists | Operator::DoesNotExist => {
                if !values.is_empty() {
                    return Err(Error::validation(format!(
                        "operator {operator:?} takes no values, got {}",
                        values.len()
                    )));
                }
            }
        }
        Ok(Self {
            key,
            operator,
            values,
        })
    }

    /// Returns true if the labels satisfy this requirement.
    #[must_use]
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals => value.is_some_and(|v| v == &self.values[0]),
            Operator::NotEquals => value.is_some_and(|v| v != &self.values[0]),
            Operator::In => value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            Operator::NotIn => value.is_none_or(|v| self.values.iter().all(|x| x != v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

/// A conjunction of label requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector {
    /// The requirements, all of which must match.
    pub requirements: Vec<Requirement>,
}

impl Selector {
    /// The empty selector, which matches every node.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            requirements: Vec::new(),
        }
    }

    /// Creates a selector from requirements.
    #[must_use]
    pub fn new(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    /// Returns true if the labels satisfy every requirement.
    #[must_use]
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Returns true if the selector carries no requirements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn equals_and_not_equals() {
        let eq = Requirement::new("zone", Operator::Equals, vec!["eu-1".into()]).unwrap();
        let ne = Requirement::new("zone", Operator::NotEquals, vec!["eu-1".into()]).unwrap();

        assert!(eq.matches(&labels(&[("zone", "eu-1")])));
        assert!(!eq.matches(&labels(&[("zone", "us-2")])));
        assert!(!eq.matches(&labels(&[])));

        assert!(ne.matches(&labels(&[("zone", "us-2")])));
        assert!(!ne.matches(&labels(&[("zone", "eu-1")])));
        // NotEquals requires the key to exist.
        assert!(!ne.matches(&labels(&[])));
    }

    #[test]
    fn set_membership() {
        let r#in =
            Requirement::new("arch", Operator::In, vec!["amd64".into(), "arm64".into()]).unwrap();
        let notin = Requirement::new("arch", Operator::NotIn, vec!["riscv".into()]).unwrap();

        assert!(r#in.matches(&labels(&[("arch", "arm64")])));
        assert!(!r#in.matches(&labels(&[("arch", "riscv")])));
        assert!(!r#in.matches(&labels(&[])));

        assert!(notin.matches(&labels(&[("arch", "amd64")])));
        // NotIn accepts absent keys.
        assert!(notin.matches(&labels(&[])));
        assert!(!notin.matches(&labels(&[("arch", "riscv")])));
    }

    #[test]
    fn existence() {
        let exists = Requirement::new("gpu", Operator::Exists, vec![]).unwrap();
        let absent = Requirement::new("gpu", Operator::DoesNotExist, vec![]).unwrap();

        assert!(exists.matches(&labels(&[("gpu", "a100")])));
        assert!(!exists.matches(&labels(&[])));
        assert!(absent.matches(&labels(&[])));
        assert!(!absent.matches(&labels(&[("gpu", "a100")])));
    }

    #[test]
    fn selector_is_a_conjunction() {
        let sel = Selector::new(vec![
            Requirement::new("zone", Operator::Equals, vec!["eu-1".into()]).unwrap(),
            Requirement::new("gpu", Operator::Exists, vec![]).unwrap(),
        ]);
        assert!(sel.matches(&labels(&[("zone", "eu-1"), ("gpu", "a100")])));
        assert!(!sel.matches(&labels(&[("zone", "eu-1")])));
        assert!(Selector::empty().matches(&labels(&[])));
    }

    #[test]
    fn arity_validation() {
        assert!(Requirement::new("k", Operator::Equals, vec![]).is_err());
        assert!(Requirement::new("k", Operator::In, vec![]).is_err());
        assert!(Requirement::new("k", Operator::Exists, vec!["v".into()]).is_err());
        assert!(Requirement::new(" ", Operator::Exists, vec![]).is_err());
    }
}
