//! Kubernetes Events (spec §4.I, §6.5), recorded against the source Service.
//! Thin wrapper over `kube::runtime::events::Recorder`, grounded in the
//! `Recorder::new(client, reporter, object_ref).publish(Event { .. })`
//! pattern used across the retrieval pack's controllers.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;

pub const REASON_LEADER_SERVICE_CREATED: &str = "LeaderServiceCreated";
pub const REASON_LEADER_ROUTING_AVAILABLE: &str = "LeaderRoutingAvailable";
pub const REASON_LEADER_CHANGED: &str = "LeaderChanged";
pub const REASON_NO_READY_PODS: &str = "NoReadyPods";
pub const REASON_NO_PODS_FOUND: &str = "NoPodsFound";
pub const REASON_PORT_RESOLUTION_FAILED: &str = "PortResolutionFailed";
pub const REASON_ENDPOINTSLICE_DELETED: &str = "EndpointSliceDeleted";
pub const REASON_INVALID_SELECTOR: &str = "InvalidSelector";

pub struct EventPublisher {
    client: Client,
    reporter: Reporter,
}

impl EventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter::from(controller_name.to_owned()),
        }
    }

    fn recorder(&self, reference: ObjectReference) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone(), reference)
    }

    async fn emit(
        &self,
        reference: ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
        action: &str,
    ) {
        let recorder = self.recorder(reference);
        if let Err(err) = recorder
            .publish(Event {
                type_,
                reason: reason.to_string(),
                note: Some(note),
                action: action.to_string(),
                secondary: None,
            })
            .await
        {
            tracing::warn!(%err, reason, "failed to publish event");
        }
    }

    pub async fn leader_service_created(&self, reference: ObjectReference, leader_service_name: &str) {
        self.emit(
            reference,
            EventType::Normal,
            REASON_LEADER_SERVICE_CREATED,
            format!("created leader service {leader_service_name}"),
            "Reconciling",
        )
        .await;
    }

    pub async fn leader_routing_available(&self, reference: ObjectReference, pod_name: &str) {
        self.emit(
            reference,
            EventType::Normal,
            REASON_LEADER_ROUTING_AVAILABLE,
            format!("leader routing available, leader pod {pod_name}"),
            "Reconciling",
        )
        .await;
    }

    pub async fn leader_changed(&self, reference: ObjectReference, from: Option<&str>, to: &str) {
        let note = match from {
            Some(from) => format!("leader changed from {from} to {to}"),
            None => format!("leader elected: {to}"),
        };
        self.emit(reference, EventType::Normal, REASON_LEADER_CHANGED, note, "Reconciling")
            .await;
    }

    pub async fn no_ready_pods(&self, reference: ObjectReference) {
        self.emit(
            reference,
            EventType::Warning,
            REASON_NO_READY_PODS,
            "no eligible pods; leader routing unavailable".to_string(),
            "Reconciling",
        )
        .await;
    }

    pub async fn selector_invalid(&self, reference: ObjectReference) {
        self.emit(
            reference,
            EventType::Warning,
            REASON_INVALID_SELECTOR,
            "a non-empty label selector is required to opt in".to_string(),
            "Reconciling",
        )
        .await;
    }

    pub async fn no_pods_found(&self, reference: ObjectReference) {
        self.emit(
            reference,
            EventType::Warning,
            REASON_NO_PODS_FOUND,
            "no pods matched the selector".to_string(),
            "Reconciling",
        )
        .await;
    }

    pub async fn port_resolution_failed(&self, reference: ObjectReference, port_name: &str) {
        self.emit(
            reference,
            EventType::Warning,
            REASON_PORT_RESOLUTION_FAILED,
            format!("could not resolve named target port {port_name}"),
            "Reconciling",
        )
        .await;
    }

    pub async fn endpointslice_deleted(&self, reference: ObjectReference) {
        self.emit(
            reference,
            EventType::Normal,
            REASON_ENDPOINTSLICE_DELETED,
            "managed EndpointSlice removed".to_string(),
            "Cleanup",
        )
        .await;
    }
}
