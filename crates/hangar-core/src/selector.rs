//! Label selectors for server-side watch filtering.
//!
//! Supports a comma-separated conjunction of:
//!
//! - `key=value` / `key==value`
//! - `key!=value`
//! - `key in (a,b,c)`
//! - `key notin (a,b,c)`
//!
//! ```rust
//! use std::collections::BTreeMap;
//!
//! use hangar_core::selector::LabelSelector;
//!
//! let selector: LabelSelector = "state in (in_queue,update,delete)".parse().unwrap();
//! let labels = BTreeMap::from([("state".to_string(), "update".to_string())]);
//! assert!(selector.matches(&labels));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// One requirement within a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// Label must equal the value.
    Equals(String, String),
    /// Label must be absent or differ from the value.
    NotEquals(String, String),
    /// Label must be one of the values.
    In(String, Vec<String>),
    /// Label must be absent or none of the values.
    NotIn(String, Vec<String>),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::NotEquals(key, value) => labels.get(key) != Some(value),
            Self::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::NotIn(key, values) => labels.get(key).is_none_or(|v| !values.contains(v)),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(key, value) => write!(f, "{key}={value}"),
            Self::NotEquals(key, value) => write!(f, "{key}!={value}"),
            Self::In(key, values) => write!(f, "{key} in ({})", values.join(",")),
            Self::NotIn(key, values) => write!(f, "{key} notin ({})", values.join(",")),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Creates a selector matching everything.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Creates a `key in (values)` selector.
    #[must_use]
    pub fn key_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            requirements: vec![Requirement::In(
                key.into(),
                values.into_iter().map(Into::into).collect(),
            )],
        }
    }

    /// Returns the parsed requirements.
    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Returns true if every requirement matches the labels.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for clause in split_clauses(input)? {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(clause)?);
        }
        Ok(Self { requirements })
    }
}

/// Splits on commas that are not inside a parenthesised value set.
fn split_clauses(input: &str) -> Result<Vec<&str>, Error> {
    let mut clauses = Vec::new();
    let mut depth = 0_u32;
    let mut start = 0;
    for (idx, ch) in input.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    Error::InvalidInput(format!("unbalanced ')' in selector: {input}"))
                })?;
            }
            ',' if depth == 0 => {
                clauses.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::InvalidInput(format!(
            "unbalanced '(' in selector: {input}"
        )));
    }
    clauses.push(&input[start..]);
    Ok(clauses)
}

fn parse_requirement(clause: &str) -> Result<Requirement, Error> {
    if let Some((key, rest)) = split_set_operator(clause, " notin ") {
        return Ok(Requirement::NotIn(valid_key(key, clause)?, parse_set(rest, clause)?));
    }
    if let Some((key, rest)) = split_set_operator(clause, " in ") {
        return Ok(Requirement::In(valid_key(key, clause)?, parse_set(rest, clause)?));
    }
    if let Some((key, value)) = clause.split_once("!=") {
        return Ok(Requirement::NotEquals(
            valid_key(key, clause)?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = clause.split_once("==").or_else(|| clause.split_once('=')) {
        return Ok(Requirement::Equals(
            valid_key(key, clause)?,
            value.trim().to_string(),
        ));
    }
    Err(Error::InvalidInput(format!(
        "unsupported selector clause: {clause}"
    )))
}

fn split_set_operator<'a>(clause: &'a str, operator: &str) -> Option<(&'a str, &'a str)> {
    let idx = clause.find(operator)?;
    Some((&clause[..idx], &clause[idx + operator.len()..]))
}

fn valid_key(key: &str, clause: &str) -> Result<String, Error> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(Error::InvalidInput(format!(
            "invalid selector key in clause: {clause}"
        )));
    }
    Ok(key.to_string())
}

fn parse_set(raw: &str, clause: &str) -> Result<Vec<String>, Error> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| Error::InvalidInput(format!("expected (a,b,...) in clause: {clause}")))?;
    let values: Vec<String> = inner
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        return Err(Error::InvalidInput(format!(
            "empty value set in clause: {clause}"
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn parses_set_membership() {
        let selector: LabelSelector = "state in (in_queue,update,delete)".parse().unwrap();
        assert_eq!(
            selector.requirements(),
            &[Requirement::In(
                "state".into(),
                vec!["in_queue".into(), "update".into(), "delete".into()]
            )]
        );
        assert!(selector.matches(&labels(&[("state", "delete")])));
        assert!(!selector.matches(&labels(&[("state", "succeeded")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn parses_conjunction_of_mixed_clauses() {
        let selector: LabelSelector = "state=LOCKED, tier notin (gold), zone!=eu"
            .parse()
            .unwrap();
        assert_eq!(selector.requirements().len(), 3);
        assert!(selector.matches(&labels(&[("state", "LOCKED")])));
        assert!(!selector.matches(&labels(&[("state", "LOCKED"), ("tier", "gold")])));
        assert!(!selector.matches(&labels(&[("state", "LOCKED"), ("zone", "eu")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector: LabelSelector = "  ".parse().unwrap();
        assert!(selector.matches(&labels(&[("anything", "x")])));
        assert_eq!(selector, LabelSelector::everything());
    }

    #[test]
    fn rejects_malformed_clauses() {
        assert!("state in in_queue".parse::<LabelSelector>().is_err());
        assert!("state in ()".parse::<LabelSelector>().is_err());
        assert!("state in (a".parse::<LabelSelector>().is_err());
        assert!("just-a-word".parse::<LabelSelector>().is_err());
        assert!("=value".parse::<LabelSelector>().is_err());
    }

    #[test]
    fn display_reparses_to_same_selector() {
        let selector = LabelSelector::key_in("state", ["in_queue", "update"]);
        assert_eq!(selector.to_string(), "state in (in_queue,update)");
        let reparsed: LabelSelector = selector.to_string().parse().unwrap();
        assert_eq!(reparsed, selector);
    }

    proptest! {
        #[test]
        fn in_selector_matches_exactly_its_members(
            members in proptest::collection::vec("[a-z_]{1,8}", 1..5),
            probe in "[a-z_]{1,8}",
        ) {
            let selector = LabelSelector::key_in("state", members.clone());
            let matched = selector.matches(&labels(&[("state", probe.as_str())]));
            prop_assert_eq!(matched, members.contains(&probe));
        }
    }
}
