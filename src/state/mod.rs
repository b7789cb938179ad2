//! Application state for the storefront client.
//!
//! Holds the shared services (API client, connectivity, queue, runner) and
//! the three persisted slices. Each slice is written to the encrypted store
//! under its own key; transient fields (loading flags, errors, cart
//! versions) are skipped by serde and start fresh on every launch.

pub mod auth;
pub mod cart;
pub mod product;

pub use auth::AuthState;
pub use cart::{CartLine, CartState, MutationAck, OPTIMISTIC_WINDOW};
pub use product::ProductState;

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::api::client::ApiClient;
use crate::api::endpoints::Endpoint;
use crate::api::error::ApiError;
use crate::api::types::{HttpMethod, ProductDto};
use crate::connectivity::ConnectivityObserver;
use crate::storage::{EncryptedStore, FileStore, KeyValueStore, StorageError};
use crate::sync::{
    MutationAction, MutationQueue, QueueError, SyncRunner, SyncSettings, SyncedMutation,
};

/// Production store: AES-GCM sealed files, one per key.
pub type Store = EncryptedStore<FileStore>;

/// A state slice persisted under its own storage key.
pub trait PersistedSlice: Serialize + DeserializeOwned + Default {
    const KEY: &'static str;
}

impl PersistedSlice for AuthState {
    const KEY: &'static str = "persist.auth";
}

impl PersistedSlice for CartState {
    const KEY: &'static str = "persist.cart";
}

impl PersistedSlice for ProductState {
    const KEY: &'static str = "persist.product";
}

pub async fn persist_slice<S: KeyValueStore, T: PersistedSlice>(
    store: &S,
    slice: &T,
) -> Result<(), StorageError> {
    store.set_json(T::KEY, slice).await
}

/// Load a slice, falling back to its default when absent or unreadable.
pub async fn restore_slice<S: KeyValueStore, T: PersistedSlice>(store: &S) -> T {
    match store.get_json::<T>(T::KEY).await {
        Ok(Some(slice)) => slice,
        Ok(None) => T::default(),
        Err(e) => {
            log::warn!("Discarding unreadable {}: {}", T::KEY, e);
            T::default()
        }
    }
}

/// Shared state handed to every command and background task.
///
/// Services are constructed once and passed around by `Arc`; nothing here
/// is global.
pub struct AppState<S = Store> {
    pub connectivity: Arc<ConnectivityObserver>,
    pub api: Arc<ApiClient>,
    pub store: Arc<S>,
    pub queue: Arc<MutationQueue<S>>,
    pub runner: Arc<SyncRunner<S, ApiClient>>,

    pub auth: RwLock<AuthState>,
    pub cart: RwLock<CartState>,
    pub products: RwLock<ProductState>,
}

impl<S: KeyValueStore> AppState<S> {
    pub fn new(
        api: Arc<ApiClient>,
        store: Arc<S>,
        settings: SyncSettings,
        dead_letter_after: u32,
    ) -> Self {
        let connectivity = api.connectivity().clone();
        let queue = Arc::new(
            MutationQueue::new(store.clone(), connectivity.clone())
                .with_dead_letter_after(dead_letter_after),
        );
        let runner = Arc::new(SyncRunner::new(
            queue.clone(),
            api.clone(),
            connectivity.clone(),
            settings,
        ));
        Self {
            connectivity,
            api,
            store,
            queue,
            runner,
            auth: RwLock::new(AuthState::default()),
            cart: RwLock::new(CartState::default()),
            products: RwLock::new(ProductState::default()),
        }
    }

    /// Load all persisted slices.
    pub async fn restore(&self) {
        *self.auth.write().await = restore_slice(&*self.store).await;
        *self.cart.write().await = restore_slice(&*self.store).await;
        *self.products.write().await = restore_slice(&*self.store).await;
        log::debug!("Persisted state restored");
    }

    async fn save<T: PersistedSlice>(&self, slice: &T) {
        if let Err(e) = persist_slice(&*self.store, slice).await {
            log::error!("Failed to persist {}: {}", T::KEY, e);
        }
    }

    // ── Auth ─────────────────────────────────────────────────────────────

    pub async fn login(&self, email: &str, password: &str) -> Result<(), ApiError> {
        {
            let mut auth = self.auth.write().await;
            auth.loading = true;
            auth.error = None;
        }

        let result = self.api.login(email, password).await;
        let snapshot = {
            let mut auth = self.auth.write().await;
            match &result {
                Ok(()) => *auth = AuthState::logged_in(email),
                Err(e) => {
                    e.report("Login");
                    auth.loading = false;
                    auth.error = Some(e.user_message());
                }
            }
            auth.clone()
        };
        self.save(&snapshot).await;
        result
    }

    /// Server logout (best effort), then wipe the auth and cart slices and
    /// every mutation still queued for this session.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self.api.logout().await;
        if let Err(e) = self.queue.clear().await {
            log::error!("Failed to clear mutation queue on logout: {}", e);
        }
        *self.auth.write().await = AuthState::default();
        *self.cart.write().await = CartState::default();
        self.save(&AuthState::default()).await;
        self.save(&CartState::default()).await;
        result
    }

    pub async fn mark_session_expired(&self) {
        let snapshot = {
            let mut auth = self.auth.write().await;
            auth.mark_session_expired();
            auth.clone()
        };
        self.save(&snapshot).await;
    }

    // ── Cart ─────────────────────────────────────────────────────────────

    /// Add to the cart locally and queue the server write.
    pub async fn add_to_cart(
        &self,
        product: &ProductDto,
        quantity: u32,
    ) -> Result<String, QueueError> {
        let (snapshot, version) = {
            let mut cart = self.cart.write().await;
            let version = cart.add_item_at(product, quantity, Instant::now());
            (cart.clone(), version)
        };
        self.save(&snapshot).await;

        self.queue
            .enqueue(
                MutationAction::Create,
                Endpoint::Cart.path(),
                HttpMethod::Post,
                cart::cart_mutation_payload(product.id, quantity, version),
            )
            .await
    }

    /// Set a line's quantity locally and queue the server write. A quantity
    /// of 0 removes the line. Returns `None` if the product is not in the
    /// cart.
    pub async fn set_cart_quantity(
        &self,
        product_id: u64,
        quantity: u32,
    ) -> Result<Option<String>, QueueError> {
        let (snapshot, version) = {
            let mut cart = self.cart.write().await;
            match cart.set_quantity_at(product_id, quantity, Instant::now()) {
                Some(version) => (cart.clone(), version),
                None => return Ok(None),
            }
        };
        self.save(&snapshot).await;

        let (action, method) = if quantity == 0 {
            (MutationAction::Delete, HttpMethod::Delete)
        } else {
            (MutationAction::Update, HttpMethod::Patch)
        };
        let id = self
            .queue
            .enqueue(
                action,
                &Endpoint::Cart.item(product_id),
                method,
                cart::cart_mutation_payload(product_id, quantity, version),
            )
            .await?;
        Ok(Some(id))
    }

    pub async fn remove_from_cart(&self, product_id: u64) -> Result<Option<String>, QueueError> {
        self.set_cart_quantity(product_id, 0).await
    }

    /// Fetch the server cart and merge it under the optimistic window rule.
    pub async fn refresh_cart(&self) -> Result<(), ApiError> {
        self.cart.write().await.loading = true;
        let result = self.api.fetch_cart().await;

        let snapshot = {
            let mut cart = self.cart.write().await;
            cart.loading = false;
            match &result {
                Ok(response) => cart.apply_server_cart_at(response, None, Instant::now()),
                Err(e) => {
                    e.report("Cart refresh");
                    if e.is_reportable() {
                        cart.error = Some(e.user_message());
                    }
                }
            }
            cart.clone()
        };
        if result.is_ok() {
            self.save(&snapshot).await;
        }
        result.map(|_| ())
    }

    /// Merge the server's answer to a synced mutation into the cart.
    pub async fn apply_synced(&self, synced: &SyncedMutation) -> bool {
        let snapshot = {
            let mut cart = self.cart.write().await;
            if !cart.reconcile_synced(synced, Instant::now()) {
                return false;
            }
            cart.clone()
        };
        self.save(&snapshot).await;
        true
    }

    // ── Catalog ──────────────────────────────────────────────────────────

    /// Refresh products and categories. On failure the cached catalog stays.
    pub async fn refresh_catalog(&self) -> Result<(), ApiError> {
        self.products.write().await.loading = true;
        let result = async {
            let products = self.api.fetch_products().await?;
            let categories = self.api.fetch_categories().await?;
            Ok::<_, ApiError>((products, categories))
        }
        .await;

        let snapshot = {
            let mut state = self.products.write().await;
            state.loading = false;
            match result {
                Ok((products, categories)) => state.replace(products, categories),
                Err(e) => {
                    e.report("Catalog refresh");
                    if e.is_reportable() {
                        state.error = Some(e.user_message());
                    }
                    return Err(e);
                }
            }
            state.clone()
        };
        self.save(&snapshot).await;
        Ok(())
    }

    // ── Background tasks ─────────────────────────────────────────────────

    /// Feed synced mutations into the cart until the runner goes away.
    pub async fn run_cart_reconciler(&self, mut synced_rx: broadcast::Receiver<SyncedMutation>) {
        loop {
            match synced_rx.recv().await {
                Ok(synced) => {
                    if self.apply_synced(&synced).await {
                        log::debug!("Cart reconciled with mutation {}", synced.item.id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Cart reconciler missed {} synced mutations, refetching", missed);
                    let _ = self.refresh_cart().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Mirror the client's session-expired signal into the auth slice.
    pub async fn run_session_watcher(&self) {
        let mut expired_rx = self.api.subscribe_session_expired();
        while expired_rx.changed().await.is_ok() {
            let expired = *expired_rx.borrow_and_update();
            if expired {
                self.mark_session_expired().await;
            }
        }
    }
}
