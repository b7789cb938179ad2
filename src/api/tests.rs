//! ApiClient behavior against an in-process mock backend.

#[cfg(test)]
mod client_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use crate::api::auth::{MemoryTokenStore, TokenStore};
    use crate::api::client::ApiClient;
    use crate::api::endpoints::Endpoint;
    use crate::api::error::{ErrorKind, OFFLINE_ERROR_CODE};
    use crate::api::types::HttpMethod;
    use crate::connectivity::{ConnectivityObserver, ConnectivityState};
    use crate::storage::MemoryStore;
    use crate::sync::{MutationAction, MutationQueue, SyncRunner, SyncSettings};

    // ── Mock Backend ─────────────────────────────────────────────────────

    struct Backend {
        valid_token: Mutex<String>,
        requests: AtomicUsize,
        cart_hits: AtomicUsize,
        refresh_hits: AtomicUsize,
        address_bodies: Mutex<Vec<Value>>,
    }

    impl Backend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                valid_token: Mutex::new("valid".to_string()),
                requests: AtomicUsize::new(0),
                cart_hits: AtomicUsize::new(0),
                refresh_hits: AtomicUsize::new(0),
                address_bodies: Mutex::new(Vec::new()),
            })
        }

        fn authorized(&self, headers: &HeaderMap) -> bool {
            let expected = format!("Bearer {}", self.valid_token.lock().unwrap());
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(|v| v == expected)
                .unwrap_or(false)
        }
    }

    type Reply = (StatusCode, Json<Value>);

    async fn cart(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Reply {
        backend.requests.fetch_add(1, Ordering::SeqCst);
        backend.cart_hits.fetch_add(1, Ordering::SeqCst);
        // Let concurrent requests pile up before answering.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if !backend.authorized(&headers) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": "Given token not valid for any token type"})),
            );
        }
        (
            StatusCode::OK,
            Json(json!({"items": [
                {"productId": 1, "productName": "Thé vert", "unitPriceCents": 450, "quantity": 2}
            ]})),
        )
    }

    async fn refresh(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Reply {
        backend.requests.fetch_add(1, Ordering::SeqCst);
        backend.refresh_hits.fetch_add(1, Ordering::SeqCst);
        if body["refresh"] == "r1" {
            *backend.valid_token.lock().unwrap() = "fresh".to_string();
            (StatusCode::OK, Json(json!({"access": "fresh"})))
        } else {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": "Token is invalid or expired"})),
            )
        }
    }

    async fn login(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Reply {
        backend.requests.fetch_add(1, Ordering::SeqCst);
        if body["email"] == "amina@example.com" && body["password"] == "secret" {
            (StatusCode::OK, Json(json!({"access": "valid", "refresh": "r1"})))
        } else {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": "No active account found with the given credentials"})),
            )
        }
    }

    async fn addresses(
        State(backend): State<Arc<Backend>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Reply {
        backend.requests.fetch_add(1, Ordering::SeqCst);
        if !backend.authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, Json(json!({})));
        }
        if body.get("street").is_none() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"street": ["Ce champ est obligatoire."]})),
            );
        }
        backend.address_bodies.lock().unwrap().push(body.clone());
        (StatusCode::CREATED, Json(json!({"id": 9})))
    }

    async fn products(State(backend): State<Arc<Backend>>) -> (StatusCode, &'static str) {
        backend.requests.fetch_add(1, Ordering::SeqCst);
        (StatusCode::INTERNAL_SERVER_ERROR, "<h1>Server Error (500)</h1>")
    }

    async fn spawn_backend(backend: Arc<Backend>) -> String {
        let app = Router::new()
            .route(Endpoint::Cart.path(), get(cart))
            .route(Endpoint::TokenRefresh.path(), post(refresh))
            .route(Endpoint::Login.path(), post(login))
            .route(Endpoint::Addresses.path(), post(addresses))
            .route(Endpoint::Products.path(), get(products))
            .with_state(backend);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: &str, tokens: Arc<MemoryTokenStore>) -> ApiClient {
        let connectivity = Arc::new(ConnectivityObserver::new(ConnectivityState::online("wifi")));
        ApiClient::new(base_url, tokens, connectivity)
    }

    // ── Tests ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_expired_token_refreshes_and_retries_once() {
        let backend = Backend::new();
        let url = spawn_backend(backend.clone()).await;
        let tokens = Arc::new(MemoryTokenStore::with_tokens("stale", "r1"));
        let api = client(&url, tokens.clone());

        let cart = api.fetch_cart().await.unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 2);

        assert_eq!(backend.cart_hits.load(Ordering::SeqCst), 2);
        assert_eq!(backend.refresh_hits.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.access_token().unwrap().as_deref(), Some("fresh"));
        assert_eq!(tokens.refresh_token().unwrap().as_deref(), Some("r1"));
        assert!(!api.is_session_expired());
    }

    #[tokio::test]
    async fn test_concurrent_401s_refresh_once() {
        let backend = Backend::new();
        let url = spawn_backend(backend.clone()).await;
        let api = client(&url, Arc::new(MemoryTokenStore::with_tokens("stale", "r1")));

        let (a, b, c) = tokio::join!(api.fetch_cart(), api.fetch_cart(), api.fetch_cart());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(backend.refresh_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_expires_session() {
        let backend = Backend::new();
        let url = spawn_backend(backend.clone()).await;
        let api = client(&url, Arc::new(MemoryTokenStore::with_tokens("stale", "revoked")));
        let mut expired_rx = api.subscribe_session_expired();

        let err = api.fetch_cart().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(api.is_session_expired());
        expired_rx.changed().await.unwrap();
        assert!(*expired_rx.borrow());
        // No retry after a failed refresh.
        assert_eq!(backend.cart_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_offline_rejects_without_network_request() {
        let backend = Backend::new();
        let url = spawn_backend(backend.clone()).await;
        let api = client(&url, Arc::new(MemoryTokenStore::with_tokens("valid", "r1")));

        api.connectivity().force_offline(true);
        let err = api.fetch_cart().await.unwrap_err();
        assert_eq!(err.code(), OFFLINE_ERROR_CODE);
        assert!(!err.is_reportable());
        let err = api.login("amina@example.com", "secret").await.unwrap_err();
        assert_eq!(err.code(), OFFLINE_ERROR_CODE);
        assert_eq!(backend.requests.load(Ordering::SeqCst), 0);

        api.connectivity().force_offline(false);
        assert!(api.fetch_cart().await.is_ok());
        assert_eq!(backend.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_stores_tokens_and_rewrites_bad_credentials() {
        let backend = Backend::new();
        let url = spawn_backend(backend.clone()).await;
        let tokens = Arc::new(MemoryTokenStore::default());
        let api = client(&url, tokens.clone());

        let err = api.login("amina@example.com", "wrong").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.user_message(), "Email ou mot de passe incorrect.");
        // A 401 from login never triggers a refresh.
        assert_eq!(backend.refresh_hits.load(Ordering::SeqCst), 0);

        api.login("amina@example.com", "secret").await.unwrap();
        assert_eq!(tokens.access_token().unwrap().as_deref(), Some("valid"));
        assert_eq!(tokens.refresh_token().unwrap().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_error_classification_from_backend() {
        let backend = Backend::new();
        let url = spawn_backend(backend.clone()).await;
        let api = client(&url, Arc::new(MemoryTokenStore::with_tokens("valid", "r1")));

        let err = api
            .send(reqwest::Method::POST, Endpoint::Addresses.path(), Some(&json!({"city": "Lyon"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.user_message(), "Ce champ est obligatoire.");

        let err = api.fetch_products().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(
            err.user_message(),
            "Le serveur rencontre un problème. Veuillez réessayer plus tard."
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let api = client(
            &format!("http://127.0.0.1:{}", port),
            Arc::new(MemoryTokenStore::default()),
        );
        let err = api.fetch_cart().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_queue_drains_through_api_client() {
        let backend = Backend::new();
        let url = spawn_backend(backend.clone()).await;
        let api = Arc::new(client(&url, Arc::new(MemoryTokenStore::with_tokens("valid", "r1"))));
        let connectivity = api.connectivity().clone();

        let queue = Arc::new(MutationQueue::new(
            Arc::new(MemoryStore::new()),
            connectivity.clone(),
        ));
        let runner = SyncRunner::new(
            queue.clone(),
            api.clone(),
            connectivity,
            SyncSettings {
                base_backoff: std::time::Duration::from_millis(1),
                batch_delay: std::time::Duration::from_millis(1),
                ..SyncSettings::default()
            },
        );

        queue
            .enqueue(
                MutationAction::Create,
                Endpoint::Addresses.path(),
                HttpMethod::Post,
                json!({"street": "12 rue des Lilas", "city": "Lyon"}),
            )
            .await
            .unwrap();

        let report = runner.drain().await;
        assert_eq!(report.succeeded, 1);
        assert!(queue.get_all().await.is_empty());
        let bodies = backend.address_bodies.lock().unwrap().clone();
        assert_eq!(bodies, vec![json!({"street": "12 rue des Lilas", "city": "Lyon"})]);
    }
}
