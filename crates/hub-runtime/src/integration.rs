//! Integration layer seam
//!
//! Integrations own the wire protocols. The runtime hands them
//! [`HubAction`]s and never looks at bytes itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use hub_core::{HubAction, HubResponse, Protocol};
use tracing::{debug, instrument, trace};

use crate::error::{RuntimeError, RuntimeResult};

/// A protocol integration (Zigbee radio, LAN, cloud bridge, ...)
#[async_trait]
pub trait Integration: Send + Sync {
    fn id(&self) -> &str;

    /// Protocols this integration can carry when no integration id is given
    fn protocols(&self) -> &[Protocol];

    async fn process_action(&self, action: HubAction) -> RuntimeResult<Option<HubResponse>>;
}

/// Integrations indexed by id
pub struct IntegrationRegistry {
    integrations: DashMap<String, Arc<dyn Integration>>,
    /// Registration order, for deterministic protocol resolution
    order: Mutex<Vec<String>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self {
            integrations: DashMap::new(),
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, integration: Arc<dyn Integration>) {
        let id = integration.id().to_string();
        debug!(integration = %id, "Registering integration");
        if self.integrations.insert(id.clone(), integration).is_none() {
            self.order
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Integration>> {
        self.integrations.get(id).map(|i| i.clone())
    }

    /// Resolve by id, or by protocol when no id is given or it is unknown
    pub fn resolve(
        &self,
        integration_id: Option<&str>,
        protocol: Option<&Protocol>,
    ) -> Option<Arc<dyn Integration>> {
        if let Some(integration) = integration_id.and_then(|id| self.get(id)) {
            return Some(integration);
        }
        let protocol = protocol?;
        let order = self.order.lock().unwrap_or_else(|p| p.into_inner());
        order
            .iter()
            .filter_map(|id| self.get(id))
            .find(|integration| integration.protocols().contains(protocol))
    }

    #[instrument(skip(self, action), fields(action = %action.action))]
    pub async fn process_action(
        &self,
        integration_id: Option<&str>,
        action: HubAction,
    ) -> RuntimeResult<Option<HubResponse>> {
        let integration = self
            .resolve(integration_id, action.protocol.as_ref())
            .ok_or_else(|| {
                RuntimeError::Integration(format!(
                    "no integration for id {:?} / protocol {:?}",
                    integration_id, action.protocol
                ))
            })?;
        trace!(integration = %integration.id(), "Sending action");
        integration.process_action(action).await
    }

    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }
}

impl Default for IntegrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Actions a [`VirtualIntegration`] keeps by default
pub const SENT_HISTORY: usize = 256;

/// Integration for devices with no radio behind them; keeps the most recent
/// actions it was sent
pub struct VirtualIntegration {
    id: String,
    protocols: Vec<Protocol>,
    capacity: usize,
    sent: Mutex<VecDeque<HubAction>>,
}

impl VirtualIntegration {
    pub fn new(id: impl Into<String>, protocols: Vec<Protocol>) -> Self {
        Self::with_history(id, protocols, SENT_HISTORY)
    }

    /// Keep at most `capacity` actions, dropping the oldest first
    pub fn with_history(id: impl Into<String>, protocols: Vec<Protocol>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            protocols,
            capacity,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Retained actions, oldest first
    pub fn sent(&self) -> Vec<HubAction> {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Integration for VirtualIntegration {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    async fn process_action(&self, action: HubAction) -> RuntimeResult<Option<HubResponse>> {
        debug!(integration = %self.id, action = %action.action, dni = ?action.dni, "Virtual action");
        if self.capacity == 0 {
            return Ok(None);
        }
        let mut sent = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        while sent.len() >= self.capacity {
            sent.pop_front();
        }
        sent.push_back(action);
        Ok(None)
    }
}
