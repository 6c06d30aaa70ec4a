//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use dashmap::DashSet;
use tokio::net::TcpListener;

use control_plane::health::{HealthProbe, ProbeError, ProbeSignal};
use control_plane::lifecycle::{HookError, ServiceHooks, StopMode};
use control_plane::registry::ServiceDescriptor;

/// Start a programmable mock backend on an ephemeral port.
///
/// `f` receives the request path and returns status and JSON body.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    let app = Router::new().fallback(move |uri: Uri| {
        let f = f.clone();
        async move {
            let (status, body) = f(uri.path().to_string()).await;
            (
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }
    });

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Mock backend answering every call with `status`, counting calls.
pub async fn start_counting_backend(status: u16, body: &'static str) -> (SocketAddr, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let addr = start_programmable_backend(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            (status, body.to_string())
        }
    })
    .await;
    (addr, calls)
}

/// Mock service whose `/health` endpoint can be switched up and down.
pub async fn start_health_endpoint(up: Arc<AtomicBool>) -> SocketAddr {
    start_programmable_backend(move |_| {
        let up = up.clone();
        async move {
            if up.load(Ordering::SeqCst) {
                (200, r#"{"status":"ok"}"#.to_string())
            } else {
                (503, r#"{"status":"down"}"#.to_string())
            }
        }
    })
    .await
}

/// In-process stand-in for managed services: hooks flip a running set, the probe reads it.
#[derive(Default)]
pub struct ScriptedServices {
    running: DashSet<String>,
    broken: DashSet<String>,
    starts: dashmap::DashMap<String, u32>,
}

impl ScriptedServices {
    pub fn break_service(&self, name: &str) {
        self.broken.insert(name.to_string());
    }

    pub fn fix_service(&self, name: &str) {
        self.broken.remove(name);
    }

    pub fn starts(&self, name: &str) -> u32 {
        self.starts.get(name).map(|s| *s).unwrap_or(0)
    }
}

#[async_trait]
impl HealthProbe for ScriptedServices {
    async fn probe(&self, service: &ServiceDescriptor) -> Result<ProbeSignal, ProbeError> {
        if self.running.contains(&service.name) && !self.broken.contains(&service.name) {
            Ok(ProbeSignal::Up)
        } else {
            Err(ProbeError::Status(503))
        }
    }
}

#[async_trait]
impl ServiceHooks for ScriptedServices {
    async fn start(&self, service: &ServiceDescriptor) -> Result<(), HookError> {
        *self.starts.entry(service.name.clone()).or_insert(0) += 1;
        self.running.insert(service.name.clone());
        Ok(())
    }

    async fn stop(&self, service: &ServiceDescriptor, _mode: StopMode) -> Result<(), HookError> {
        self.running.remove(&service.name);
        Ok(())
    }
}
