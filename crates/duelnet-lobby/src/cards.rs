//! Card resolution — hydrating deck id lists into full card records.
//!
//! One batch request per match start. The HTTP card database is an
//! external dependency behind the [`CardSource`] seam so tests can
//! substitute a stub.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use duelnet_core::types::{Card, CardId, Deck, HydratedDeck};

/// Batch card lookup.
#[async_trait]
pub trait CardSource: Send + Sync {
    async fn resolve(&self, ids: &[CardId]) -> Result<HashMap<CardId, Card>>;
}

/// Card source backed by an HTTP endpoint accepting
/// `POST {"ids": [..]}` and returning an array of card records, each
/// carrying an `id` field.
pub struct HttpCardSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCardSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CardSource for HttpCardSource {
    async fn resolve(&self, ids: &[CardId]) -> Result<HashMap<CardId, Card>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        debug!(count = ids.len(), endpoint = %self.endpoint, "Resolving cards");

        let records: Vec<Value> = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await
            .context("card lookup request")?
            .error_for_status()
            .context("card lookup status")?
            .json()
            .await
            .context("card lookup body")?;

        let mut by_id = HashMap::new();
        for record in records {
            let id = record
                .get("id")
                .and_then(Value::as_u64)
                .context("card record missing numeric id")?;
            by_id.insert(id, record);
        }
        Ok(by_id)
    }
}

/// Replace every id in the deck by its full record, preserving list
/// order. A referenced id missing from the resolved batch fails the
/// hydration.
pub fn hydrate_deck(deck: &Deck, records: &HashMap<CardId, Card>) -> Result<HydratedDeck> {
    let mut hydrated = HydratedDeck::default();
    for (list, ids) in &deck.0 {
        let mut cards = Vec::with_capacity(ids.len());
        for id in ids {
            match records.get(id) {
                Some(card) => cards.push(card.clone()),
                None => bail!("card {id} not resolved"),
            }
        }
        hydrated.0.insert(list.clone(), cards);
    }
    Ok(hydrated)
}
