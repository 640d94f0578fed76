// src/catalog/resolver.rs
//
// Locating one offer by provider and kit name.

use crate::models::{FederatedCatalog, Offer, ResolvedOffer};
use crate::traits::OfferLookup;

/// Returns the first offer named `kit_name` published by `provider_id`.
///
/// `None` is a normal outcome. If a provider publishes two offers with the
/// same name, whichever comes first in the snapshot wins.
pub fn resolve(catalog: &FederatedCatalog, provider_id: &str, kit_name: &str) -> Option<Offer> {
    LinearLookup::new(catalog)
        .find_offer(provider_id, kit_name)
        .map(|resolved| resolved.offer)
}

/// `OfferLookup` over a borrowed snapshot, scanning participants then offers.
pub struct LinearLookup<'a> {
    catalog: &'a FederatedCatalog,
}

impl<'a> LinearLookup<'a> {
    pub fn new(catalog: &'a FederatedCatalog) -> Self {
        Self { catalog }
    }
}

impl OfferLookup for LinearLookup<'_> {
    fn find_offer(&self, provider_id: &str, kit_name: &str) -> Option<ResolvedOffer> {
        self.catalog
            .iter()
            .filter(|entry| entry.participant_id == provider_id)
            .find_map(|entry| {
                entry
                    .datasets
                    .iter()
                    .find(|offer| offer.kit_name == kit_name)
                    .map(|offer| ResolvedOffer {
                        offer: offer.clone(),
                        participant_id: entry.participant_id.clone(),
                        originator: entry.originator.clone(),
                    })
            })
    }
}
