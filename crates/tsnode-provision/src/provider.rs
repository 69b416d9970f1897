use crate::error::ProvisionResult;
use async_trait::async_trait;
use tsnode_identity::StoredKeyPair;

/// Instance state name the provider reports once an instance is gone.
pub const STATE_TERMINATED: &str = "terminated";

/// One instance as seen by a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub id: String,
    pub state: String,
    pub address: Option<String>,
}

impl InstanceDescriptor {
    pub fn is_terminated(&self) -> bool {
        self.state == STATE_TERMINATED
    }
}

/// Instance status summary paired with its first detail status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootStatus {
    pub status: String,
    pub detail: String,
}

impl BootStatus {
    pub fn new(status: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            detail: detail.into(),
        }
    }

    pub fn is_initializing(&self) -> bool {
        self.status == "initializing" && self.detail == "initializing"
    }

    pub fn is_ready(&self) -> bool {
        self.status == "ok" && self.detail == "passed"
    }
}

/// Everything needed to launch the single instance of a node.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub region: &'a str,
    pub instance_type: &'a str,
    pub image_id: &'a str,
    /// Node name: instance tag, key-pair name.
    pub name: &'a str,
    pub ingress_policy_id: &'a str,
}

/// The compute-provider surface the lifecycle sagas need.
///
/// Every resource except the instance itself is addressed by node name.
#[async_trait]
pub trait ComputeProvider: Send + Sync + std::fmt::Debug {
    async fn list_regions(&self) -> ProvisionResult<Vec<String>>;
    async fn list_instance_types(&self, region: &str) -> ProvisionResult<Vec<String>>;
    async fn list_images(&self, region: &str) -> ProvisionResult<Vec<String>>;

    async fn import_access_key(
        &self,
        region: &str,
        name: &str,
        public_key: &str,
    ) -> ProvisionResult<()>;
    async fn delete_access_key(&self, region: &str, name: &str) -> ProvisionResult<()>;

    /// Create the SSH-ingress policy; returns its provider id.
    async fn create_ingress_policy(&self, region: &str, name: &str) -> ProvisionResult<String>;
    /// Delete by name. Succeeds when the policy is already gone.
    async fn delete_ingress_policy(&self, region: &str, name: &str) -> ProvisionResult<()>;

    /// Launch exactly one instance; returns its id.
    async fn launch_instance(&self, spec: &LaunchSpec<'_>) -> ProvisionResult<String>;
    /// The instance tagged with `name`, if any reservation matches.
    async fn find_instance_by_tag(
        &self,
        region: &str,
        name: &str,
    ) -> ProvisionResult<Option<InstanceDescriptor>>;
    async fn describe_instance(
        &self,
        region: &str,
        instance_id: &str,
    ) -> ProvisionResult<InstanceDescriptor>;
    /// Request termination; returns how many instances entered terminating.
    async fn terminate_instance(&self, region: &str, instance_id: &str) -> ProvisionResult<usize>;
    /// `None` while the provider reports no status for the instance.
    async fn boot_status(
        &self,
        region: &str,
        instance_id: &str,
    ) -> ProvisionResult<Option<BootStatus>>;
}

/// Settings for the VPN agent on a freshly booted host.
#[derive(Clone)]
pub struct AgentSetup {
    pub hostname: String,
    pub auth_token: String,
    pub exit_node: bool,
}

impl std::fmt::Debug for AgentSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSetup")
            .field("hostname", &self.hostname)
            .field("auth_token", &"[REDACTED]")
            .field("exit_node", &self.exit_node)
            .finish()
    }
}

/// Remote shell access to a launched host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync + std::fmt::Debug {
    /// Trust-on-first-use: record the host key the host presents.
    async fn record_host_identity(&self, address: &str, key: &StoredKeyPair)
    -> ProvisionResult<()>;

    /// Install and enrol the VPN agent. The host key must match the record.
    async fn run_remote_setup(
        &self,
        address: &str,
        key: &StoredKeyPair,
        setup: &AgentSetup,
    ) -> ProvisionResult<()>;
}
