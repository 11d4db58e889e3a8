//! Host services for running scripts
//!
//! Scripts execute on blocking threads. Lookups that must hand a value back
//! to the script block on the runtime's async API from there.

use std::future::Future;
use std::sync::Weak;
use std::time::Duration;

use hub_core::EntityRef;
use hub_sandbox::{
    ChildDeviceRequest, DeviceSnapshot, HttpMethod, HttpRequest, HttpResponse, SandboxHost,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::runtime::EntityRuntime;

pub struct RuntimeHost {
    runtime: Weak<EntityRuntime>,
    http: reqwest::Client,
}

impl RuntimeHost {
    pub fn new(runtime: Weak<EntityRuntime>, http_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { runtime, http }
    }

    /// Run `f` against the runtime from a blocking thread
    fn block_on<F, Fut, T>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(std::sync::Arc<EntityRuntime>) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let runtime = self
            .runtime
            .upgrade()
            .ok_or_else(|| "runtime is shutting down".to_string())?;
        let handle = Handle::try_current().map_err(|e| e.to_string())?;
        handle.block_on(f(runtime))
    }

    async fn send(client: reqwest::Client, request: HttpRequest) -> Result<HttpResponse, String> {
        let mut builder = match request.method {
            HttpMethod::Get => client.get(&request.uri),
            HttpMethod::Post => client.post(&request.uri),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = match body {
                serde_json::Value::String(text) => builder.body(text.clone()),
                other => builder.json(other),
            };
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|e| e.to_string())?;
        debug!(uri = %request.uri, status, "HTTP request completed");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl SandboxHost for RuntimeHost {
    fn device(&self, id: &str) -> Option<DeviceSnapshot> {
        self.block_on(|runtime| async move {
            runtime.device_snapshot(id).await.map_err(|e| e.to_string())
        })
        .unwrap_or_else(|e| {
            warn!(device_id = %id, error = %e, "Device lookup failed");
            None
        })
    }

    fn child_devices(&self, parent: &EntityRef) -> Vec<DeviceSnapshot> {
        self.block_on(|runtime| async move {
            runtime.child_snapshots(parent).await.map_err(|e| e.to_string())
        })
        .unwrap_or_else(|e| {
            warn!(parent = %parent, error = %e, "Child device lookup failed");
            Vec::new()
        })
    }

    fn add_child_device(
        &self,
        parent: &EntityRef,
        request: ChildDeviceRequest,
    ) -> Result<DeviceSnapshot, String> {
        self.block_on(|runtime| async move {
            let device = runtime
                .add_child_device(parent, request)
                .await
                .map_err(|e| e.to_string())?;
            runtime
                .device_snapshot(&device.id)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("device {} vanished", device.id))
        })
    }

    fn http(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let client = self.http.clone();
        let handle = Handle::try_current().map_err(|e| e.to_string())?;
        handle.block_on(Self::send(client, request))
    }
}
