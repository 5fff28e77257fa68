//! Data types for batch requests.

use serde::Serialize;
use serde_json::Value;

use rsrest_domain::{DomainError, SubRequest, SubResponse};

/// Status forced on the whole batch when any leaf was forbidden.
pub const FORBIDDEN_STATUS: u16 = 403;

/// Parsed batch body.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchBody {
    /// `[{href, verb, body}, ...]`: one run with the configured concurrency.
    Flat(Vec<SubRequest>),
    /// `[[...], [...]]`: groups run one after another.
    Grouped(Vec<Vec<SubRequest>>),
}

impl BatchBody {
    /// Parses and checks the shape of a batch body.
    pub fn parse(value: &Value, max_batch_size: usize) -> Result<Self, DomainError> {
        let Value::Array(elements) = value else {
            return Err(DomainError::bad_request(
                rsrest_domain::error::error_codes::BATCH_INVALID_ELEMENT,
                "batch body must be a JSON array",
            ));
        };
        if elements.is_empty() {
            return Err(DomainError::empty_batch());
        }

        let objects = elements.iter().filter(|e| e.is_object()).count();
        let arrays = elements.iter().filter(|e| e.is_array()).count();
        if objects > 0 && arrays > 0 {
            return Err(DomainError::invalid_type_mix());
        }

        let body = if arrays > 0 {
            let mut groups = Vec::with_capacity(elements.len());
            let mut offset = 0;
            for element in elements {
                let Value::Array(members) = element else {
                    return Err(DomainError::invalid_element(offset, "expected an array"));
                };
                if members.is_empty() {
                    return Err(DomainError::empty_batch());
                }
                if members.iter().any(Value::is_array) {
                    return Err(DomainError::invalid_type_mix());
                }
                groups.push(parse_elements(members, offset)?);
                offset += members.len();
            }
            BatchBody::Grouped(groups)
        } else {
            BatchBody::Flat(parse_elements(elements, 0)?)
        };

        let size = body.leaf_count();
        if size > max_batch_size {
            return Err(DomainError::batch_too_large(size, max_batch_size));
        }
        Ok(body)
    }

    /// Number of sub-requests across all groups.
    pub fn leaf_count(&self) -> usize {
        match self {
            BatchBody::Flat(leaves) => leaves.len(),
            BatchBody::Grouped(groups) => groups.iter().map(Vec::len).sum(),
        }
    }

    /// Groups in execution order; a flat body is one group.
    pub fn into_groups(self) -> Vec<Vec<SubRequest>> {
        match self {
            BatchBody::Flat(leaves) => vec![leaves],
            BatchBody::Grouped(groups) => groups,
        }
    }
}

fn parse_elements(elements: &[Value], offset: usize) -> Result<Vec<SubRequest>, DomainError> {
    elements
        .iter()
        .enumerate()
        .map(|(index, element)| {
            if !element.is_object() {
                return Err(DomainError::invalid_element(offset + index, "expected an object"));
            }
            serde_json::from_value::<SubRequest>(element.clone())
                .map_err(|err| DomainError::invalid_element(offset + index, err))
        })
        .collect()
}

/// Result of executing a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// Aggregate status, see [`aggregate_status`].
    pub status: u16,
    /// One response per leaf, in input order (groups flattened).
    pub results: Vec<SubResponse>,
    /// Non-fatal notes such as ambiguous route matches.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl BatchOutcome {
    pub fn new(results: Vec<SubResponse>, warnings: Vec<String>) -> Self {
        Self {
            status: aggregate_status(&results),
            results,
            warnings,
        }
    }
}

/// Highest leaf status, except that any 403 makes the whole batch 403.
pub fn aggregate_status(results: &[SubResponse]) -> u16 {
    if results.iter().any(|r| r.status == FORBIDDEN_STATUS) {
        return FORBIDDEN_STATUS;
    }
    results.iter().map(|r| r.status).max().unwrap_or(200)
}
