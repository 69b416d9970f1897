//! In-process collaborators for lifecycle tests.
//!
//! [`FakeProvider`] keeps launched instances in memory, keyed by tag, and
//! records every call. [`FakeExecutor`] records what it would have run on a
//! host. Both can be told to fail a named operation.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tsnode_identity::{KeyStore, StoredKeyPair};
use tsnode_provision::{
    AgentSetup, BootStatus, ComputeProvider, InstanceDescriptor, LaunchSpec, NodeLifecycle,
    Poller, ProvisionError, ProvisionResult, RemoteExecutor, STATE_TERMINATED,
};
use tsnode_state::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListRegions,
    ListInstanceTypes { region: String },
    ListImages { region: String },
    ImportAccessKey { region: String, name: String },
    DeleteAccessKey { region: String, name: String },
    CreateIngressPolicy { region: String, name: String },
    DeleteIngressPolicy { region: String, name: String },
    LaunchInstance { region: String, name: String, image_id: String },
    FindInstanceByTag { region: String, name: String },
    DescribeInstance { region: String, instance_id: String },
    TerminateInstance { region: String, instance_id: String },
    BootStatus { region: String, instance_id: String },
}

impl Call {
    /// Operation name used by [`FakeProvider::fail_on`].
    pub fn operation(&self) -> &'static str {
        match self {
            Call::ListRegions => "list_regions",
            Call::ListInstanceTypes { .. } => "list_instance_types",
            Call::ListImages { .. } => "list_images",
            Call::ImportAccessKey { .. } => "import_access_key",
            Call::DeleteAccessKey { .. } => "delete_access_key",
            Call::CreateIngressPolicy { .. } => "create_ingress_policy",
            Call::DeleteIngressPolicy { .. } => "delete_ingress_policy",
            Call::LaunchInstance { .. } => "launch_instance",
            Call::FindInstanceByTag { .. } => "find_instance_by_tag",
            Call::DescribeInstance { .. } => "describe_instance",
            Call::TerminateInstance { .. } => "terminate_instance",
            Call::BootStatus { .. } => "boot_status",
        }
    }
}

#[derive(Debug, Clone)]
struct FakeInstance {
    descriptor: InstanceDescriptor,
    /// Lookups left before a shutting-down instance reports terminated.
    polls_until_terminated: usize,
}

#[derive(Debug, Default)]
struct ProviderState {
    calls: Vec<Call>,
    failing: HashSet<&'static str>,
    instances: BTreeMap<String, FakeInstance>,
    boot_script: VecDeque<Option<BootStatus>>,
    terminate_reports: Option<usize>,
    polls_until_terminated: usize,
    launched: u32,
}

#[derive(Debug, Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<R>(&self, f: impl FnOnce(&mut ProviderState) -> R) -> R {
        let mut state = self.state.lock().expect("fake provider lock poisoned");
        f(&mut state)
    }

    /// Make every call of `operation` fail with a remote-call error.
    pub fn fail_on(&self, operation: &'static str) {
        self.with(|s| s.failing.insert(operation));
    }

    pub fn clear_failures(&self) {
        self.with(|s| s.failing.clear());
    }

    /// Boot statuses returned in order; `ok/passed` once exhausted.
    pub fn script_boot(&self, statuses: Vec<Option<BootStatus>>) {
        self.with(|s| s.boot_script = statuses.into());
    }

    /// Override how many instances `terminate_instance` claims to stop.
    pub fn report_terminated(&self, count: usize) {
        self.with(|s| s.terminate_reports = Some(count));
    }

    /// How many tag lookups a shutting-down instance survives.
    pub fn terminate_after_polls(&self, polls: usize) {
        self.with(|s| s.polls_until_terminated = polls);
    }

    /// Pretend an instance with this tag already exists.
    pub fn seed_instance(&self, name: &str, instance_id: &str, state: &str) {
        self.with(|s| {
            s.instances.insert(
                name.to_string(),
                FakeInstance {
                    descriptor: InstanceDescriptor {
                        id: instance_id.to_string(),
                        state: state.to_string(),
                        address: Some("198.51.100.9".to_string()),
                    },
                    polls_until_terminated: 0,
                },
            );
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    /// Operation names in call order.
    pub fn operations(&self) -> Vec<&'static str> {
        self.with(|s| s.calls.iter().map(Call::operation).collect())
    }

    pub fn instance(&self, name: &str) -> Option<InstanceDescriptor> {
        self.with(|s| s.instances.get(name).map(|i| i.descriptor.clone()))
    }

    fn record(&self, call: Call) -> ProvisionResult<()> {
        let operation = call.operation();
        self.with(|s| {
            s.calls.push(call);
            if s.failing.contains(operation) {
                Err(ProvisionError::remote(operation, "injected failure"))
            } else {
                Ok(())
            }
        })
    }
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    async fn list_regions(&self) -> ProvisionResult<Vec<String>> {
        self.record(Call::ListRegions)?;
        Ok(vec!["eu-west-1".to_string(), "us-east-1".to_string()])
    }

    async fn list_instance_types(&self, region: &str) -> ProvisionResult<Vec<String>> {
        self.record(Call::ListInstanceTypes {
            region: region.to_string(),
        })?;
        Ok(vec!["t2.micro".to_string(), "t3.small".to_string()])
    }

    async fn list_images(&self, region: &str) -> ProvisionResult<Vec<String>> {
        self.record(Call::ListImages {
            region: region.to_string(),
        })?;
        Ok(vec!["ami-0jammy".to_string()])
    }

    async fn import_access_key(&self, region: &str, name: &str, _: &str) -> ProvisionResult<()> {
        self.record(Call::ImportAccessKey {
            region: region.to_string(),
            name: name.to_string(),
        })
    }

    async fn delete_access_key(&self, region: &str, name: &str) -> ProvisionResult<()> {
        self.record(Call::DeleteAccessKey {
            region: region.to_string(),
            name: name.to_string(),
        })
    }

    async fn create_ingress_policy(&self, region: &str, name: &str) -> ProvisionResult<String> {
        self.record(Call::CreateIngressPolicy {
            region: region.to_string(),
            name: name.to_string(),
        })?;
        Ok(format!("sg-{name}"))
    }

    async fn delete_ingress_policy(&self, region: &str, name: &str) -> ProvisionResult<()> {
        self.record(Call::DeleteIngressPolicy {
            region: region.to_string(),
            name: name.to_string(),
        })
    }

    async fn launch_instance(&self, spec: &LaunchSpec<'_>) -> ProvisionResult<String> {
        self.record(Call::LaunchInstance {
            region: spec.region.to_string(),
            name: spec.name.to_string(),
            image_id: spec.image_id.to_string(),
        })?;
        Ok(self.with(|s| {
            s.launched += 1;
            let n = s.launched;
            let id = format!("i-{n:08x}");
            s.instances.insert(
                spec.name.to_string(),
                FakeInstance {
                    descriptor: InstanceDescriptor {
                        id: id.clone(),
                        state: "running".to_string(),
                        address: Some(format!("203.0.113.{n}")),
                    },
                    polls_until_terminated: 0,
                },
            );
            id
        }))
    }

    async fn find_instance_by_tag(
        &self,
        region: &str,
        name: &str,
    ) -> ProvisionResult<Option<InstanceDescriptor>> {
        self.record(Call::FindInstanceByTag {
            region: region.to_string(),
            name: name.to_string(),
        })?;
        Ok(self.with(|s| {
            let instance = s.instances.get_mut(name)?;
            if instance.descriptor.state == "shutting-down" {
                if instance.polls_until_terminated == 0 {
                    instance.descriptor.state = STATE_TERMINATED.to_string();
                    instance.descriptor.address = None;
                } else {
                    instance.polls_until_terminated -= 1;
                }
            }
            Some(instance.descriptor.clone())
        }))
    }

    async fn describe_instance(
        &self,
        region: &str,
        instance_id: &str,
    ) -> ProvisionResult<InstanceDescriptor> {
        self.record(Call::DescribeInstance {
            region: region.to_string(),
            instance_id: instance_id.to_string(),
        })?;
        self.with(|s| {
            s.instances
                .values()
                .find(|i| i.descriptor.id == instance_id)
                .map(|i| i.descriptor.clone())
        })
        .ok_or_else(|| ProvisionError::NotFound {
            kind: "instance",
            name: instance_id.to_string(),
        })
    }

    async fn terminate_instance(&self, region: &str, instance_id: &str) -> ProvisionResult<usize> {
        self.record(Call::TerminateInstance {
            region: region.to_string(),
            instance_id: instance_id.to_string(),
        })?;
        Ok(self.with(|s| {
            let polls = s.polls_until_terminated;
            if let Some(instance) = s
                .instances
                .values_mut()
                .find(|i| i.descriptor.id == instance_id)
            {
                instance.descriptor.state = "shutting-down".to_string();
                instance.polls_until_terminated = polls;
            }
            s.terminate_reports.unwrap_or(1)
        }))
    }

    async fn boot_status(
        &self,
        region: &str,
        instance_id: &str,
    ) -> ProvisionResult<Option<BootStatus>> {
        self.record(Call::BootStatus {
            region: region.to_string(),
            instance_id: instance_id.to_string(),
        })?;
        Ok(self.with(|s| {
            s.boot_script
                .pop_front()
                .unwrap_or_else(|| Some(BootStatus::new("ok", "passed")))
        }))
    }
}

// ─── Executor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    RecordHostIdentity {
        address: String,
        key_name: String,
    },
    RunRemoteSetup {
        address: String,
        hostname: String,
        exit_node: bool,
    },
}

#[derive(Debug, Default)]
struct ExecutorState {
    calls: Vec<RemoteCall>,
    fail_setup: bool,
}

#[derive(Debug, Default)]
pub struct FakeExecutor {
    state: Mutex<ExecutorState>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_setup(&self) {
        self.state.lock().expect("fake executor lock poisoned").fail_setup = true;
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().expect("fake executor lock poisoned").calls.clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn record_host_identity(&self, address: &str, key: &StoredKeyPair) -> ProvisionResult<()> {
        let mut state = self.state.lock().expect("fake executor lock poisoned");
        state.calls.push(RemoteCall::RecordHostIdentity {
            address: address.to_string(),
            key_name: key.name.clone(),
        });
        Ok(())
    }

    async fn run_remote_setup(
        &self,
        address: &str,
        _key: &StoredKeyPair,
        setup: &AgentSetup,
    ) -> ProvisionResult<()> {
        let mut state = self.state.lock().expect("fake executor lock poisoned");
        state.calls.push(RemoteCall::RunRemoteSetup {
            address: address.to_string(),
            hostname: setup.hostname.clone(),
            exit_node: setup.exit_node,
        });
        if state.fail_setup {
            return Err(ProvisionError::remote("remote setup", "tailscale up exited with 1"));
        }
        Ok(())
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

/// A lifecycle over fakes and a throwaway installation directory.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub provider: Arc<FakeProvider>,
    pub executor: Arc<FakeExecutor>,
    pub lifecycle: NodeLifecycle,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = FakeProvider::new();
        let executor = FakeExecutor::new();
        let lifecycle = NodeLifecycle::new(
            provider.clone(),
            executor.clone(),
            StateStore::new(dir.path().join("state.json")),
            KeyStore::new(dir.path().join("keys")),
            Poller::new(Duration::ZERO, Duration::from_secs(5)),
        );
        Self {
            dir,
            provider,
            executor,
            lifecycle,
        }
    }

    pub fn state(&self) -> &StateStore {
        self.lifecycle.state()
    }

    pub fn keys(&self) -> &KeyStore {
        self.lifecycle.keys()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
