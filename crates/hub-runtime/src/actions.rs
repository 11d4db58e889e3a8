//! Action interpreter
//!
//! Sends the steps of a decoded driver [`Action`] in order. A pause does not
//! hold the caller: the remaining steps continue on their own task after the
//! delay.

use std::collections::VecDeque;
use std::sync::Arc;

use hub_core::{Action, HubAction, Step};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::integration::IntegrationRegistry;

/// Where the steps of an action go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionTarget {
    pub integration_id: Option<String>,
    /// Network id stamped on actions that carry none
    pub device_network_id: Option<String>,
}

pub struct ActionInterpreter {
    integrations: Arc<IntegrationRegistry>,
}

impl ActionInterpreter {
    pub fn new(integrations: Arc<IntegrationRegistry>) -> Self {
        Self { integrations }
    }

    /// Send the action's steps; returns the continuation task if it paused
    pub async fn dispatch(&self, target: &ActionTarget, action: Action) -> Option<JoinHandle<()>> {
        let mut steps: VecDeque<Step> = action.into_steps().into();
        while let Some(step) = steps.pop_front() {
            match step {
                Step::Send(hub_action) => send(&self.integrations, target, hub_action).await,
                Step::Pause(delay) => {
                    debug!(?delay, remaining = steps.len(), "Action sequence paused");
                    let integrations = self.integrations.clone();
                    let target = target.clone();
                    return Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        for step in steps {
                            match step {
                                Step::Send(hub_action) => {
                                    send(&integrations, &target, hub_action).await
                                }
                                Step::Pause(delay) => tokio::time::sleep(delay).await,
                            }
                        }
                    }));
                }
            }
        }
        None
    }
}

async fn send(integrations: &IntegrationRegistry, target: &ActionTarget, mut action: HubAction) {
    if action.dni.is_none() {
        action.dni = target.device_network_id.clone();
    }
    if let Err(e) = integrations
        .process_action(target.integration_id.as_deref(), action)
        .await
    {
        warn!(error = %e, "Action not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::VirtualIntegration;
    use hub_core::Protocol;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (ActionInterpreter, Arc<VirtualIntegration>) {
        let registry = Arc::new(IntegrationRegistry::new());
        let zigbee = Arc::new(VirtualIntegration::new("zb", vec![Protocol::Zigbee]));
        registry.register(zigbee.clone());
        (ActionInterpreter::new(registry), zigbee)
    }

    fn target() -> ActionTarget {
        ActionTarget {
            integration_id: Some("zb".into()),
            device_network_id: Some("0A1B".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_with_delay_continues_later() {
        let (interpreter, zigbee) = setup();
        let action = Action::decode(&json!(["st cmd 0x1 1 6 1 {}", "delay 500", "st rattr 0x1 1 6 0"]))
            .unwrap()
            .unwrap();

        let continuation = interpreter.dispatch(&target(), action).await;
        assert_eq!(zigbee.sent().len(), 1);
        assert_eq!(zigbee.sent()[0].dni.as_deref(), Some("0A1B"));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(zigbee.sent().len(), 1);

        continuation.unwrap().await.unwrap();
        let sent = zigbee.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].action, "st rattr 0x1 1 6 0");
    }

    #[tokio::test]
    async fn test_lone_delay_is_noop() {
        let (interpreter, zigbee) = setup();
        let action = Action::decode(&json!("delay 1000")).unwrap().unwrap();
        assert!(interpreter.dispatch(&target(), action).await.is_none());
        assert!(zigbee.sent().is_empty());
    }

    #[tokio::test]
    async fn test_opaque_string_goes_to_device_integration() {
        let (interpreter, zigbee) = setup();
        let action = Action::decode(&json!("custom payload")).unwrap().unwrap();
        interpreter.dispatch(&target(), action).await;
        assert_eq!(zigbee.sent()[0].protocol, None);
    }
}
