//! Shared setup for the integration suites: a substrate (or bare
//! factory) running against the in-memory fake store.
#![allow(dead_code)]

use redgate::{ConnectionConfig, ConnectionFactory, Substrate, SubstrateConfig, TenantId};
use redgate_connection::fake::{FakeConnector, FakeStore};
use std::sync::Arc;

pub fn tenant_a() -> TenantId {
    TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb").unwrap()
}

pub fn tenant_b() -> TenantId {
    TenantId::parse("b7c8d1e2-3f40-4a51-9b62-7c8d9e0f1a2b").unwrap()
}

pub async fn fake_factory(store: &FakeStore) -> Arc<ConnectionFactory> {
    fake_factory_with(store, ConnectionConfig::default()).await
}

pub async fn fake_factory_with(
    store: &FakeStore,
    config: ConnectionConfig,
) -> Arc<ConnectionFactory> {
    ConnectionFactory::with_connector(config, Arc::new(FakeConnector::new(store.clone())))
        .await
        .expect("fake factory connects")
}

pub async fn fake_substrate(store: &FakeStore, tenants: Vec<TenantId>) -> Substrate {
    Substrate::builder(SubstrateConfig::default())
        .connector(Arc::new(FakeConnector::new(store.clone())))
        .serve_tenants(tenants)
        .start()
        .await
        .expect("substrate starts against the fake store")
}
