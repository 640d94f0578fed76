// src/catalog/search.rs
//
// Query-driven filtering of a federated catalog snapshot.

use crate::models::{CatalogEntry, FederatedCatalog, Offer};
use crate::query::{compile, fold_case, matches, QueryClause};
use log::{debug, warn};
use serde_json::{Map, Value};

/// Key under which the owning participant id is injected into every record.
pub const PARTICIPANT_KEY: &str = "bpn";

/// Offer keys that never take part in matching.
const HIDDEN_KEYS: [&str; 5] = [
    "@id",
    "@type",
    "odrl:hasPolicy",
    "dcat:distribution",
    "semantic_model",
];

/// Filters the catalog with a textual query.
///
/// An ill-formed query yields an empty catalog rather than an error; callers
/// that need to tell the two apart should `compile` first and use `search_with`.
pub fn search(catalog: &FederatedCatalog, query: &str) -> FederatedCatalog {
    match compile(query) {
        Ok(clauses) => search_with(catalog, &clauses),
        Err(e) => {
            warn!("CatalogSearch: Rejecting query {:?}: {}", query, e);
            Vec::new()
        }
    }
}

/// Filters the catalog with already compiled clauses.
///
/// Every participant entry is kept; its offers are replaced by the ones that match.
pub fn search_with(catalog: &FederatedCatalog, clauses: &[QueryClause]) -> FederatedCatalog {
    catalog
        .iter()
        .map(|entry| {
            let datasets: Vec<Offer> = entry
                .datasets
                .iter()
                .filter(|offer| matches(&predicate_record(&entry.participant_id, offer), clauses))
                .cloned()
                .collect();

            debug!(
                "CatalogSearch: {} kept {}/{} offers",
                entry.participant_id,
                datasets.len(),
                entry.datasets.len()
            );

            CatalogEntry {
                datasets,
                ..entry.clone()
            }
        })
        .collect()
}

/// Flattens an offer into the record the matcher sees.
///
/// Starts from the offer's own attributes minus identifiers, policy,
/// distribution and the semantic model, merges the semantic model's keys on
/// top, case-folds every key and finally injects the participant id.
pub fn predicate_record(participant_id: &str, offer: &Offer) -> Map<String, Value> {
    let mut merged = match serde_json::to_value(offer) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for key in HIDDEN_KEYS {
        merged.remove(key);
    }

    if let Some(Value::Object(model)) = &offer.semantic_model {
        for (key, value) in model {
            merged.insert(key.clone(), value.clone());
        }
    }

    let mut record: Map<String, Value> = merged
        .into_iter()
        .map(|(key, value)| (fold_case(&key), value))
        .collect();
    record.insert(
        PARTICIPANT_KEY.to_string(),
        Value::String(participant_id.to_string()),
    );
    record
}
