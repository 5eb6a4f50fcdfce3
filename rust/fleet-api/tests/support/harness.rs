use anyhow::Context;
use axum::{
    body::{self, Body},
    Router,
};
use http::{Method, Request, StatusCode};
use fleet_api::{
    config::AppConfig, server::Server, store::DataStore, telemetry::init_tracing,
    testing::MemoryStore,
};
use serde_json::Value;
use std::{env, future::Future, path::PathBuf, sync::Arc};
use tokio::time::{sleep, Duration};
use tokio_postgres::NoTls;
use tower::ServiceExt;

const DB_CONNECT_RETRIES: usize = 20;
const DB_CONNECT_DELAY_MS: u64 = 250;

/// A router plus convenience request helpers; cheap to clone per request.
#[derive(Clone)]
pub struct FleetTestHarness {
    router: Router,
}

impl FleetTestHarness {
    /// Serves the real router over an in-process store.
    #[allow(dead_code)]
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self::in_memory_with_config(store, AppConfig::embedded("postgres://unused".into()))
    }

    /// Like [`Self::in_memory`], with caller-supplied settings such as a short timeout.
    #[allow(dead_code)]
    pub fn in_memory_with_config(store: Arc<MemoryStore>, config: AppConfig) -> Self {
        init_tracing();
        let store: Arc<dyn DataStore> = store;
        let server = Server::with_store(config, store).expect("builtin registry should validate");
        Self {
            router: server.router(),
        }
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.send(Method::GET, path, None).await
    }

    #[allow(dead_code)]
    pub async fn post(&self, path: &str, body: Value) -> http::Response<Body> {
        self.send(Method::POST, path, Some(body.to_string())).await
    }

    #[allow(dead_code)]
    pub async fn put(&self, path: &str, body: Value) -> http::Response<Body> {
        self.send(Method::PUT, path, Some(body.to_string())).await
    }

    #[allow(dead_code)]
    pub async fn patch(&self, path: &str, body: Value) -> http::Response<Body> {
        self.send(Method::PATCH, path, Some(body.to_string())).await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str) -> http::Response<Body> {
        self.send(Method::DELETE, path, None).await
    }

    /// Sends a raw body verbatim, for malformed-payload cases.
    #[allow(dead_code)]
    pub async fn send_raw(&self, method: Method, path: &str, body: &str) -> http::Response<Body> {
        self.send(method, path, Some(body.to_string())).await
    }

    async fn send(&self, method: Method, path: &str, body: Option<String>) -> http::Response<Body> {
        let builder = Request::builder().method(method).uri(path);
        let request = match body {
            Some(body) => builder
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body)),
            None => builder.body(Body::empty()),
        }
        .expect("failed to build harness request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should not fail")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

/// Runs a test closure against a server backed by a freshly seeded Postgres database.
///
/// Skips (and passes) when `FLEET_TEST_DATABASE_URL` is not set.
#[allow(dead_code)]
pub async fn with_fleet_harness<F, Fut>(test: F)
where
    F: FnOnce(FleetTestHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    init_tracing();

    let Some(database_url) = env::var("FLEET_TEST_DATABASE_URL")
        .ok()
        .filter(|value| !value.trim().is_empty())
    else {
        eprintln!("[fleet-test] skipping Postgres harness: FLEET_TEST_DATABASE_URL is not set");
        return;
    };

    seed_fixture_database(&database_url)
        .await
        .expect("failed to seed fixture database");

    let server = Server::new(AppConfig::embedded(database_url))
        .await
        .expect("failed to boot fleet API for Postgres harness");

    test(FleetTestHarness {
        router: server.router(),
    })
    .await;
}

async fn seed_fixture_database(database_url: &str) -> anyhow::Result<()> {
    let mut attempts = 0usize;
    let (client, connection) = loop {
        match tokio_postgres::connect(database_url, NoTls).await {
            Ok(pair) => break pair,
            Err(err) => {
                attempts += 1;
                if attempts >= DB_CONNECT_RETRIES {
                    return Err(err).context("fixture database never became reachable");
                }
                sleep(Duration::from_millis(DB_CONNECT_DELAY_MS)).await;
            }
        }
    };
    let task = tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("[fleet-test] fixture connection error: {err}");
        }
    });

    for name in ["schema.sql", "seed.sql"] {
        let sql = std::fs::read_to_string(fixture_path(name))
            .with_context(|| format!("failed to read fixture {name}"))?;
        client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("failed to apply fixture {name}"))?;
    }

    drop(client);
    let _ = task.await;
    Ok(())
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}
