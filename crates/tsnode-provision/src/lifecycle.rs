//! The `up` and `down` sagas.
//!
//! Both run their steps strictly in order and stop at the first failure.
//! Nothing is rolled back: a failed `up` leaves its local record (and any
//! remote resources created so far) in place so that `down` on the same id
//! can clean up.

use crate::error::{ProvisionError, ProvisionResult, SagaError, Step, StepExt};
use crate::provider::{AgentSetup, ComputeProvider, LaunchSpec, RemoteExecutor};
use crate::readiness::{BootReadiness, Poller, Progress, TerminationReadiness};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tsnode_identity::{KeyStore, StoredKeyPair};
use tsnode_state::{NodeId, NodeRecord, StateStore};

/// Input to [`NodeLifecycle::up`].
#[derive(Clone)]
pub struct UpRequest {
    pub region: String,
    pub instance_type: String,
    pub image_id: String,
    pub exit_node: bool,
    pub auth_token: String,
}

impl std::fmt::Debug for UpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpRequest")
            .field("region", &self.region)
            .field("instance_type", &self.instance_type)
            .field("image_id", &self.image_id)
            .field("exit_node", &self.exit_node)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionedNode {
    pub record: NodeRecord,
    pub instance_id: String,
    pub address: String,
    pub keys: StoredKeyPair,
}

#[derive(Debug, Clone)]
pub struct DecommissionedNode {
    pub record: NodeRecord,
    /// `None` when the provider no longer knew the instance.
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NodeLifecycle {
    provider: Arc<dyn ComputeProvider>,
    executor: Arc<dyn RemoteExecutor>,
    state: StateStore,
    keys: KeyStore,
    poller: Poller,
}

impl NodeLifecycle {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        executor: Arc<dyn RemoteExecutor>,
        state: StateStore,
        keys: KeyStore,
        poller: Poller,
    ) -> Self {
        Self {
            provider,
            executor,
            state,
            keys,
            poller,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Create a node: record, keys, remote resources, instance, VPN agent.
    pub async fn up(&self, req: &UpRequest) -> Result<ProvisionedNode, SagaError> {
        let start = Instant::now();
        let region = req.region.as_str();

        let record = self
            .state
            .add_node(region, &req.instance_type, &req.image_id)
            .at(Step::AllocateRecord)?;
        let name = record.name.as_str();
        info!(id = record.id, name, region, "bringing node up");

        let keys = self.keys.create(name).at(Step::GenerateKeys)?;

        self.provider
            .import_access_key(region, name, &keys.public_key)
            .await
            .at(Step::ImportKeys)?;

        let policy_id = self
            .provider
            .create_ingress_policy(region, name)
            .await
            .at(Step::CreateIngressPolicy)?;

        let instance_id = self
            .provider
            .launch_instance(&LaunchSpec {
                region,
                instance_type: &req.instance_type,
                image_id: &req.image_id,
                name,
                ingress_policy_id: &policy_id,
            })
            .await
            .at(Step::LaunchInstance)?;

        self.await_boot(region, &instance_id)
            .await
            .at(Step::AwaitBoot)?;

        let address = self
            .provider
            .describe_instance(region, &instance_id)
            .await
            .and_then(|instance| {
                instance.address.ok_or_else(|| ProvisionError::NotFound {
                    kind: "public address of instance",
                    name: instance_id.clone(),
                })
            })
            .at(Step::ResolveAddress)?;

        self.executor
            .record_host_identity(&address, &keys)
            .await
            .at(Step::RecordHostIdentity)?;

        let setup = AgentSetup {
            hostname: record.name.clone(),
            auth_token: req.auth_token.clone(),
            exit_node: req.exit_node,
        };
        self.executor
            .run_remote_setup(&address, &keys, &setup)
            .await
            .at(Step::Bootstrap)?;

        info!(
            id = record.id,
            name,
            %instance_id,
            %address,
            duration_ms = saturating_millis(start.elapsed()),
            "node is up"
        );
        Ok(ProvisionedNode {
            record,
            instance_id,
            address,
            keys,
        })
    }

    /// Tear a node down. Every remote step tolerates the resource already
    /// being gone, so `down` can finish a half-done `up` or `down`.
    pub async fn down(&self, id: NodeId) -> Result<DecommissionedNode, SagaError> {
        let record = self.state.get_node(id).at(Step::LoadRecord)?;
        let region = record.region.as_str();
        let name = record.name.as_str();
        info!(id, name, region, "taking node down");

        let instance = self
            .provider
            .find_instance_by_tag(region, name)
            .await
            .at(Step::FindInstance)?;

        let instance_id = match instance {
            Some(instance) => {
                let terminating = self
                    .provider
                    .terminate_instance(region, &instance.id)
                    .await
                    .and_then(|count| match count {
                        1 => Ok(()),
                        actual => Err(ProvisionError::UnexpectedCardinality {
                            operation: "TerminateInstances",
                            expected: 1,
                            actual,
                        }),
                    });
                terminating.at(Step::TerminateInstance)?;

                self.await_termination(region, name)
                    .await
                    .at(Step::AwaitTermination)?;
                Some(instance.id)
            }
            None => {
                warn!(id, name, "no instance found for node; skipping termination");
                None
            }
        };

        self.provider
            .delete_ingress_policy(region, name)
            .await
            .at(Step::DeleteIngressPolicy)?;

        self.provider
            .delete_access_key(region, name)
            .await
            .at(Step::DeleteRemoteKeys)?;

        self.keys.delete(name).at(Step::DeleteLocalKeys)?;

        self.state.remove_node(id).at(Step::RemoveRecord)?;

        info!(id, name, "node is down");
        Ok(DecommissionedNode {
            record,
            instance_id,
        })
    }

    /// Poll the instance status until it reports `ok/passed`.
    pub async fn await_boot(&self, region: &str, instance_id: &str) -> ProvisionResult<()> {
        let mut machine = BootReadiness::new();
        let progress = self
            .poller
            .run("DescribeInstanceStatus", &mut machine, || {
                self.provider.boot_status(region, instance_id)
            })
            .await?;
        match progress {
            Progress::Failed(reason) => Err(ProvisionError::BootFailed {
                instance_id: instance_id.to_string(),
                reason,
            }),
            _ => {
                info!(instance_id, "instance booted");
                Ok(())
            }
        }
    }

    /// Poll the tagged instance until it is terminated or gone.
    pub async fn await_termination(&self, region: &str, name: &str) -> ProvisionResult<()> {
        let mut machine = TerminationReadiness::new();
        self.poller
            .run("DescribeInstances", &mut machine, || {
                self.provider.find_instance_by_tag(region, name)
            })
            .await?;
        info!(name, "instance terminated");
        Ok(())
    }
}

fn saturating_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_millis() {
        assert_eq!(saturating_millis(Duration::from_secs(3)), 3_000);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }
}
