//! Resource identifier parsing and validation.
//!
//! Every resource the driver creates is named by a dotted pair
//! `<dataset>.<name>`. Names are validated before any statement is submitted so
//! a typo surfaces as a local error rather than a remote one.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::DriverError;

const MAX_IDENTIFIER_LENGTH: usize = 1_024;

static IDENTIFIER_PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("identifier regex should compile"));

/// Fully qualified `<dataset>.<name>` resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName {
    dataset: String,
    name: String,
}

impl ResourceName {
    /// Parse a dotted pair, rejecting anything that is not exactly two valid parts.
    pub fn parse(identifier: &str) -> Result<Self, DriverError> {
        let trimmed = identifier.trim();
        let invalid = |reason: &str| DriverError::InvalidIdentifier {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = trimmed.split('.');
        let (Some(dataset), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid("expected a dotted pair '<dataset>.<name>'"));
        };
        validate_part(dataset).map_err(|reason| invalid(&format!("dataset {reason}")))?;
        validate_part(name).map_err(|reason| invalid(&format!("name {reason}")))?;

        Ok(Self {
            dataset: dataset.to_string(),
            name: name.to_string(),
        })
    }

    /// Combine an already validated dataset id with a resource name.
    pub fn qualified(dataset: &str, name: &str) -> Result<Self, DriverError> {
        Self::parse(&format!("{dataset}.{name}"))
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backtick-quoted form for embedding in SQL.
    pub fn quoted(&self) -> String {
        format!("`{}.{}`", self.dataset, self.name)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.name)
    }
}

/// Validate a bare dataset identifier.
pub fn validate_dataset_id(dataset: &str) -> Result<(), DriverError> {
    validate_part(dataset).map_err(|reason| DriverError::InvalidIdentifier {
        identifier: dataset.to_string(),
        reason: format!("dataset {reason}"),
    })
}

fn validate_part(part: &str) -> Result<(), &'static str> {
    if part.is_empty() {
        return Err("must not be empty");
    }
    if part.len() > MAX_IDENTIFIER_LENGTH {
        return Err("is longer than 1024 characters");
    }
    if !IDENTIFIER_PART.is_match(part) {
        return Err("may only contain letters, digits and underscores");
    }
    Ok(())
}
