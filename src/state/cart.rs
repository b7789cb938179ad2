//! Cart slice with optimistic local updates.
//!
//! Quantity changes are applied locally before the server has seen them.
//! Each change bumps a per-product version that travels with the queued
//! mutation as `clientVersion`; when the server answers that mutation, the
//! answer carries the version back as a [`MutationAck`]. A server cart never
//! overwrites a line whose local version is newer than what the server has
//! acknowledged, so late echoes of earlier mutations cannot undo newer
//! local edits.
//!
//! Plain cart fetches carry no version. For those, lines with
//! unacknowledged local changes are protected only during
//! [`OPTIMISTIC_WINDOW`] after the last local update; past the window the
//! server is authoritative.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::endpoints::Endpoint;
use crate::api::types::{CartItemDto, CartResponse, ProductDto};
use crate::sync::queue::now_ms;
use crate::sync::SyncedMutation;

/// How long an unversioned server cart is ignored for locally edited lines.
pub const OPTIMISTIC_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: u64,
    pub name: String,
    pub unit_price_cents: u64,
    pub quantity: u32,
}

impl From<&CartItemDto> for CartLine {
    fn from(item: &CartItemDto) -> Self {
        Self {
            product_id: item.product_id,
            name: item.product_name.clone(),
            unit_price_cents: item.unit_price_cents,
            quantity: item.quantity,
        }
    }
}

/// Server acknowledgement of one versioned cart mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationAck {
    pub product_id: u64,
    pub version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartState {
    pub lines: Vec<CartLine>,
    pub item_count: u32,
    pub total_cents: u64,

    #[serde(skip)]
    pub loading: bool,
    #[serde(skip)]
    pub error: Option<String>,
    #[serde(skip)]
    local_versions: HashMap<u64, u64>,
    #[serde(skip)]
    acked_versions: HashMap<u64, u64>,
    #[serde(skip)]
    last_local_update: Option<Instant>,
}

impl CartState {
    pub fn line(&self, product_id: u64) -> Option<&CartLine> {
        self.lines.iter().find(|l| l.product_id == product_id)
    }

    pub fn quantity_of(&self, product_id: u64) -> u32 {
        self.line(product_id).map(|l| l.quantity).unwrap_or(0)
    }

    /// Local edits the server has not acknowledged yet.
    pub fn has_unacknowledged(&self, product_id: u64) -> bool {
        self.local_version(product_id) > self.acked_version(product_id)
    }

    pub fn local_version(&self, product_id: u64) -> u64 {
        self.local_versions.get(&product_id).copied().unwrap_or(0)
    }

    fn acked_version(&self, product_id: u64) -> u64 {
        self.acked_versions.get(&product_id).copied().unwrap_or(0)
    }

    /// Add `quantity` units of a product. Returns the new local version.
    pub fn add_item_at(&mut self, product: &ProductDto, quantity: u32, now: Instant) -> u64 {
        match self.lines.iter_mut().find(|l| l.product_id == product.id) {
            Some(line) => line.quantity = line.quantity.saturating_add(quantity),
            None => self.lines.push(CartLine {
                product_id: product.id,
                name: product.name.clone(),
                unit_price_cents: product.price_cents,
                quantity,
            }),
        }
        self.touch(product.id, now)
    }

    /// Set the quantity of a product already in the cart; 0 removes it.
    ///
    /// Returns `None` if the product is not in the cart.
    pub fn set_quantity_at(&mut self, product_id: u64, quantity: u32, now: Instant) -> Option<u64> {
        let index = self.lines.iter().position(|l| l.product_id == product_id)?;
        if quantity == 0 {
            self.lines.remove(index);
        } else {
            self.lines[index].quantity = quantity;
        }
        Some(self.touch(product_id, now))
    }

    pub fn remove_item_at(&mut self, product_id: u64, now: Instant) -> Option<u64> {
        self.set_quantity_at(product_id, 0, now)
    }

    /// Merge a server cart into the local one.
    ///
    /// `ack` is present when the cart is the answer to one of our queued
    /// mutations.
    pub fn apply_server_cart_at(
        &mut self,
        response: &CartResponse,
        ack: Option<MutationAck>,
        now: Instant,
    ) {
        if let Some(ack) = ack {
            let acked = self.acked_versions.entry(ack.product_id).or_insert(0);
            *acked = (*acked).max(ack.version);
        }

        let within_window = self
            .last_local_update
            .map(|at| now.saturating_duration_since(at) < OPTIMISTIC_WINDOW)
            .unwrap_or(false);
        let guarded = ack.is_some() || within_window;
        if !guarded {
            // Unversioned and past the window: the server has the last word.
            self.acked_versions = self.local_versions.clone();
        }

        let previous: HashMap<u64, CartLine> = self
            .lines
            .drain(..)
            .map(|line| (line.product_id, line))
            .collect();
        let keep_local =
            |state: &Self, product_id: u64| guarded && state.has_unacknowledged(product_id);

        let mut merged = Vec::with_capacity(response.items.len());
        for item in &response.items {
            let product_id = item.product_id;
            if keep_local(self, product_id) {
                if let Some(local) = previous.get(&product_id) {
                    merged.push(local.clone());
                }
                continue;
            }

            let mut line = CartLine::from(item);
            if line.quantity == 0 {
                match previous.get(&product_id).filter(|l| l.quantity > 0) {
                    Some(known) => line.quantity = known.quantity,
                    None => continue,
                }
            }
            merged.push(line);
        }

        // Locally added lines the server does not know about yet.
        for (product_id, local) in &previous {
            let in_response = response.items.iter().any(|i| i.product_id == *product_id);
            if !in_response && keep_local(self, *product_id) {
                merged.push(local.clone());
            }
        }

        self.lines = merged;
        self.recompute_totals();
        self.error = None;
    }

    /// Apply the server's answer to a synced cart mutation.
    ///
    /// Returns `false` when the mutation was not a cart mutation or its
    /// response is not a cart body.
    pub fn reconcile_synced(&mut self, synced: &SyncedMutation, now: Instant) -> bool {
        if !synced.item.endpoint.starts_with(Endpoint::Cart.path()) {
            return false;
        }
        let response: CartResponse = match serde_json::from_value(synced.response.clone()) {
            Ok(response) => response,
            Err(e) => {
                log::debug!("Cart mutation {} returned no cart body: {}", synced.item.id, e);
                return false;
            }
        };
        self.apply_server_cart_at(&response, ack_from_payload(&synced.item.payload), now);
        true
    }

    /// Bump the product's local version. Versions are unique across
    /// restarts because they never fall behind the wall clock.
    fn touch(&mut self, product_id: u64, now: Instant) -> u64 {
        let next = (self.local_version(product_id) + 1).max(now_ms());
        self.local_versions.insert(product_id, next);
        self.last_local_update = Some(now);
        self.recompute_totals();
        next
    }

    fn recompute_totals(&mut self) {
        self.item_count = self.lines.iter().map(|l| l.quantity).sum();
        self.total_cents = self
            .lines
            .iter()
            .map(|l| l.unit_price_cents * u64::from(l.quantity))
            .sum();
    }
}

/// Body of a queued cart mutation.
pub fn cart_mutation_payload(product_id: u64, quantity: u32, version: u64) -> Value {
    json!({
        "productId": product_id,
        "quantity": quantity,
        "clientVersion": version,
    })
}

pub fn ack_from_payload(payload: &Value) -> Option<MutationAck> {
    Some(MutationAck {
        product_id: payload.get("productId")?.as_u64()?,
        version: payload.get("clientVersion")?.as_u64()?,
    })
}
