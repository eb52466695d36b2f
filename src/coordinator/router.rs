//! Read routing: which single store serves a read, given what it is for.
//!
//! A pure function of the intent. Unclassified reads go to the relational
//! store, the same store that breaks ties during reconciliation.

use std::str::FromStr;

use crate::record::StoreKind;

/// Why the caller is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryIntent {
    /// Browsing in the visual interface
    VisualBrowse,
    /// Human curation of a record
    ManualCuration,
    /// Structured / joined queries
    ComplexQuery,
    Aggregate,
    SemanticSearch,
    Similarity,
    Unclassified,
}

impl FromStr for QueryIntent {
    type Err = std::convert::Infallible;

    /// Unknown strings are `Unclassified`, never an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "visual" | "browse" | "visual_browse" => Self::VisualBrowse,
            "curation" | "manual" | "manual_curation" => Self::ManualCuration,
            "relational" | "query" | "complex" | "complex_query" => Self::ComplexQuery,
            "aggregate" | "aggregation" => Self::Aggregate,
            "semantic" | "semantic_search" => Self::SemanticSearch,
            "similarity" | "similar" | "vector" => Self::Similarity,
            _ => Self::Unclassified,
        })
    }
}

/// Store that should serve a read with this intent.
#[must_use]
pub fn route_read(intent: QueryIntent) -> StoreKind {
    match intent {
        QueryIntent::VisualBrowse | QueryIntent::ManualCuration => StoreKind::Visual,
        QueryIntent::ComplexQuery | QueryIntent::Aggregate | QueryIntent::Unclassified => StoreKind::Relational,
        QueryIntent::SemanticSearch | QueryIntent::Similarity => StoreKind::Vector,
    }
}

/// Stores to try, in order, when `primary` cannot serve a read.
#[must_use]
pub fn fallback_order(primary: StoreKind) -> [StoreKind; 2] {
    match primary {
        StoreKind::Visual => [StoreKind::Relational, StoreKind::Vector],
        StoreKind::Relational => [StoreKind::Visual, StoreKind::Vector],
        StoreKind::Vector => [StoreKind::Relational, StoreKind::Visual],
    }
}
