//! Ownership & GC (spec §4.J, §8 invariant 8). Owner references do the real
//! work; this module is the secondary safety sweep for orphans whose
//! owner-reference GC failed or raced with a reconcile, reclaiming any
//! managed Service/EndpointSlice still labelled for a source Service that no
//! longer opts in (or no longer exists).

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE, LABEL_SOURCE_SERVICE};

/// Deletes any leader Service labelled `managed-by=zen-lead,source-service=<name>`
/// in `namespace`, then sweeps the EndpointSlices beneath each one directly
/// (rather than relying solely on owner-reference GC, which can race or fail
/// under API pressure). Idempotent: a no-op when nothing is labelled that way.
pub async fn sweep_leader_services(client: &Client, namespace: &str, source_name: &str) -> Result<usize> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let selector = format!(
        "{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_VALUE},{LABEL_SOURCE_SERVICE}={source_name}"
    );
    let list = api.list(&ListParams::default().labels(&selector)).await?;
    let mut deleted = 0;
    for svc in list.items {
        let name = svc.name_any();
        debug!(namespace, source_name, leader_service = %name, "sweeping orphaned leader service");
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace, source_name, leader_service = %name, "deleted orphaned leader service");
                deleted += 1;
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(err) => {
                warn!(namespace, source_name, leader_service = %name, %err, "failed to delete orphaned leader service");
                return Err(err.into());
            }
        }
        sweep_endpointslices(client, namespace, &name).await?;
    }
    Ok(deleted)
}

/// Same pattern for EndpointSlices labelled against a specific leader
/// Service name, used when the leader Service itself is gone but a slice
/// survived (owner-reference GC can race or fail under API pressure).
pub async fn sweep_endpointslices(client: &Client, namespace: &str, leader_service_name: &str) -> Result<usize> {
    let api: Api<EndpointSlice> = Api::namespaced(client.clone(), namespace);
    let selector = format!(
        "{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_VALUE},{}={leader_service_name}",
        crate::model::LABEL_ENDPOINTSLICE_SERVICE_NAME
    );
    let list = api.list(&ListParams::default().labels(&selector)).await?;
    let mut deleted = 0;
    for slice in list.items {
        let name = slice.name_any();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace, leader_service_name, endpointslice = %name, "deleted orphaned endpointslice");
                deleted += 1;
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(deleted)
}
