//! `up`, `down` and `ssh`: the commands that talk to the provider.

use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::info;
use tsnode_identity::{KeyStore, KnownHosts};
use tsnode_provision::{
    AwsCredentials, ComputeProvider, Ec2Provider, NodeLifecycle, ParameterFlags,
    ParameterResolver, ProvisionError, UpRequest,
};
use tsnode_remote::SshExecutor;
use tsnode_secrets::{CredentialStore, Credentials};
use tsnode_state::{NodeId, StateStore};

use crate::config::CliConfig;
use crate::error::CliResult;
use crate::layout::Layout;

/// Layout and config of one invocation.
#[derive(Debug, Clone)]
pub struct Context {
    pub layout: Layout,
    pub config: CliConfig,
}

impl Context {
    pub fn load(layout: Layout) -> CliResult<Self> {
        layout.ensure()?;
        let config = CliConfig::load_or_default(&layout.config_path())?;
        Ok(Self { layout, config })
    }

    pub fn state(&self) -> StateStore {
        StateStore::new(self.layout.state_path())
    }

    pub fn keys(&self) -> KeyStore {
        KeyStore::new(self.layout.keys_dir())
    }

    pub fn credentials(&self) -> CredentialStore {
        CredentialStore::new(self.layout.credentials_path())
    }

    /// Stored credentials; on first use taken from the environment or
    /// prompted for, then persisted.
    pub fn load_credentials(
        &self,
        input: impl BufRead,
        prompt: impl Write,
    ) -> CliResult<Credentials> {
        let creds = self.credentials().get_or_init(|| match Credentials::from_env() {
            Some(creds) => Ok(creds),
            None => Credentials::prompt(input, prompt),
        })?;
        Ok(creds)
    }

    pub fn provider(&self, creds: &Credentials) -> CliResult<Arc<Ec2Provider>> {
        let provider = Ec2Provider::new(
            AwsCredentials {
                access_key_id: creds.aws_access_key_id.clone(),
                secret_access_key: creds.aws_secret_access_key.clone(),
            },
            self.config.ec2_settings(),
        )?;
        Ok(Arc::new(provider))
    }

    pub fn lifecycle(&self, provider: Arc<dyn ComputeProvider>) -> NodeLifecycle {
        let executor = SshExecutor::new(
            self.config.ssh_settings(),
            KnownHosts::new(self.layout.known_hosts_path()),
        );
        NodeLifecycle::new(
            provider,
            Arc::new(executor),
            self.state(),
            self.keys(),
            self.config.poller(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpArgs {
    pub interactive: bool,
    pub flags: ParameterFlags,
    pub exit_node: bool,
}

/// Resolve launch parameters, then run the `up` saga.
pub async fn up<R: BufRead, W: Write>(
    lifecycle: &NodeLifecycle,
    provider: &dyn ComputeProvider,
    args: &UpArgs,
    auth_token: &str,
    input: R,
    out: &mut W,
) -> CliResult<()> {
    let params = ParameterResolver::new(provider, args.interactive, input, &mut *out)
        .resolve(&args.flags)
        .await?;
    info!(
        region = %params.region,
        instance_type = %params.instance_type,
        image_id = %params.image_id,
        exit_node = args.exit_node,
        "launch parameters resolved"
    );

    let node = lifecycle
        .up(&UpRequest {
            region: params.region,
            instance_type: params.instance_type,
            image_id: params.image_id,
            exit_node: args.exit_node,
            auth_token: auth_token.to_string(),
        })
        .await?;

    writeln!(
        out,
        "Node {} ({}) is up at {}.",
        node.record.id, node.record.name, node.address
    )?;
    Ok(())
}

pub async fn down(lifecycle: &NodeLifecycle, id: NodeId, out: &mut impl Write) -> CliResult<()> {
    let node = lifecycle.down(id).await?;
    writeln!(out, "Node {} ({}) is down.", node.record.id, node.record.name)?;
    Ok(())
}

/// The command line that opens a shell on node `id`.
pub async fn ssh_command(
    provider: &dyn ComputeProvider,
    state: &StateStore,
    keys: &KeyStore,
    user: &str,
    id: NodeId,
) -> CliResult<String> {
    let record = state.get_node(id)?;
    let address = provider
        .find_instance_by_tag(&record.region, &record.name)
        .await?
        .and_then(|instance| instance.address)
        .ok_or_else(|| ProvisionError::NotFound {
            kind: "running instance for node",
            name: record.name.clone(),
        })?;
    Ok(format!(
        "ssh -tt -i {} {user}@{address}",
        keys.private_key_path(&record.name).display()
    ))
}
