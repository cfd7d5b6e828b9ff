//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use base64::Engine;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use argon2::Params;
use pim_security_gateway::auth::credentials::hash_password;
use pim_security_gateway::clock::{Clock, SystemClock};
use pim_security_gateway::config::{GatewayConfig, UserConfig};
use pim_security_gateway::lifecycle::{startup, Shutdown};
use pim_security_gateway::security::ssrf::StaticResolver;
use pim_security_gateway::store::{
    BackingStore, FallbackStore, MemoryStore, StoreError, WindowOutcome, WindowRequest,
};
use pim_security_gateway::GatewayServer;

pub const USERNAME: &str = "editor";
pub const PASSWORD: &str = "correct horse battery staple";
pub const USER_ID: &str = "u-1001";
pub const ADMIN_KEY: &str = "test-admin-key-0123456789";

/// Defaults plus a signing key, one user, admin enabled, and an upload
/// directory under `upload_dir`.
pub fn test_config(upload_dir: &std::path::Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.tokens.signing_key = base64::engine::general_purpose::STANDARD.encode([42u8; 32]);
    config.tokens.ttl_secs = 600;
    config.admin.enabled = true;
    config.admin.api_key = ADMIN_KEY.to_string();
    config.storage.upload_dir = upload_dir.to_path_buf();
    config.users = vec![UserConfig {
        id: USER_ID.to_string(),
        username: USERNAME.to_string(),
        email: Some("editor@example.com".to_string()),
        roles: vec!["editor".to_string()],
        password_hash: hash_password(PASSWORD, Params::new(1024, 1, 1, None).unwrap()).unwrap(),
    }];
    config
}

/// A running gateway on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub client: reqwest::Client,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn login(&self, username: &str, password: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/auth/login"))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .expect("gateway unreachable")
    }

    /// Log in as the test user and return the access token.
    pub async fn token(&self) -> String {
        let res = self.login(USERNAME, PASSWORD).await;
        assert_eq!(res.status(), 200, "login should succeed");
        let body: serde_json::Value = res.json().await.unwrap();
        body["access_token"].as_str().unwrap().to_string()
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start a gateway backed by in-process state and a fixed resolver.
pub async fn start_gateway(config: GatewayConfig, resolver: StaticResolver) -> TestGateway {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(FallbackStore::local_only(MemoryStore::new(clock.clone())));
    start_gateway_with_store(config, resolver, store).await
}

pub async fn start_gateway_with_store(
    config: GatewayConfig,
    resolver: StaticResolver,
    store: Arc<dyn BackingStore>,
) -> TestGateway {
    let state = startup::build_state(&config, store, Arc::new(SystemClock), Arc::new(resolver))
        .expect("valid test config");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    let (_, config_updates) = mpsc::unbounded_channel();

    let server = GatewayServer::new(config, state);
    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });

    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    TestGateway {
        addr,
        shutdown,
        client,
    }
}

/// Serve `app` on an ephemeral loopback port.
pub async fn start_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Remote stand-in whose every call fails.
#[derive(Default)]
pub struct FailingStore {
    pub calls: AtomicUsize,
}

impl FailingStore {
    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection reset by peer".to_string()))
    }
}

#[async_trait]
impl BackingStore for FailingStore {
    fn name(&self) -> &'static str {
        "failing"
    }
    async fn set(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
        self.fail()
    }
    async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
        self.fail()
    }
    async fn exists(&self, _: &str) -> Result<bool, StoreError> {
        self.fail()
    }
    async fn delete(&self, _: &str) -> Result<(), StoreError> {
        self.fail()
    }
    async fn increment(&self, _: &str) -> Result<i64, StoreError> {
        self.fail()
    }
    async fn increment_with_ttl(&self, _: &str, _: Duration) -> Result<i64, StoreError> {
        self.fail()
    }
    async fn expire(&self, _: &str, _: Duration) -> Result<(), StoreError> {
        self.fail()
    }
    async fn add_scored(&self, _: &str, _: &str, _: f64) -> Result<(), StoreError> {
        self.fail()
    }
    async fn remove_range_by_score(&self, _: &str, _: f64, _: f64) -> Result<u64, StoreError> {
        self.fail()
    }
    async fn count_in_range(&self, _: &str, _: f64, _: f64) -> Result<u64, StoreError> {
        self.fail()
    }
    async fn acquire_in_window(
        &self,
        _: &str,
        _: &WindowRequest,
    ) -> Result<WindowOutcome, StoreError> {
        self.fail()
    }
}
