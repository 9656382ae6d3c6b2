// src/categories.rs
//! Category filter: the fixed set of place categories the places provider
//! is queried with, and the validated selection built from it.

use serde::{Deserialize, Serialize};

pub const SUPPORTED_CATEGORIES: [&str; 14] = [
    "catering.restaurant",
    "catering.cafe",
    "catering.fast_food",
    "catering.bar",
    "commercial.supermarket",
    "commercial.shopping_mall",
    "commercial.clothing",
    "commercial.convenience",
    "service.financial.atm",
    "service.vehicle.fuel",
    "service.post_office",
    "healthcare.pharmacy",
    "healthcare.hospital",
    "healthcare.clinic",
];

pub fn is_supported(code: &str) -> bool {
    SUPPORTED_CATEGORIES.contains(&code)
}

/// Validated category selection.
///
/// Always a subset of [`SUPPORTED_CATEGORIES`], without duplicates, in the
/// order the caller supplied. Equality is set equality; order only matters
/// for display and for the query string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct CategorySet(Vec<String>);

impl CategorySet {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn all() -> Self {
        validate(SUPPORTED_CATEGORIES)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.iter().any(|c| c == code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Comma-joined codes for the `categories` query parameter.
    pub fn to_query(&self) -> String {
        self.0.join(",")
    }

    /// Remove `code` if selected, otherwise append it; then re-validate.
    /// Unsupported codes leave the set unchanged.
    pub fn toggled(&self, code: &str) -> CategorySet {
        let mut next = self.0.clone();
        if let Some(pos) = next.iter().position(|c| c == code) {
            next.remove(pos);
        } else {
            next.push(code.to_string());
        }
        validate(next)
    }
}

impl PartialEq for CategorySet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|c| other.contains(c))
    }
}

impl Eq for CategorySet {}

impl From<Vec<String>> for CategorySet {
    fn from(v: Vec<String>) -> Self {
        validate(v)
    }
}

impl From<CategorySet> for Vec<String> {
    fn from(s: CategorySet) -> Self {
        s.0
    }
}

/// `requested ∩ SUPPORTED_CATEGORIES`, first occurrence wins. Never fails.
pub fn validate<I, S>(requested: I) -> CategorySet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for code in requested {
        let code = code.as_ref().trim();
        if is_supported(code) && !out.iter().any(|c| c == code) {
            out.push(code.to_string());
        }
    }
    CategorySet(out)
}
