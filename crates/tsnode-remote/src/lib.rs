//! SSH-backed [`RemoteExecutor`] for tsnode.
//!
//! `ssh2` is blocking, so every session runs on the blocking thread pool.
//! Host keys are trusted on first use: [`SshExecutor::record_host_identity`]
//! appends the key a fresh host presents, and every later session must present
//! the same key.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use ssh2::{ExtendedData, HostKeyType, Session};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};
use tsnode_identity::{HostKeyCheck, KeyError, KnownHosts, StoredKeyPair};
use tsnode_provision::{AgentSetup, ProvisionError, ProvisionResult, RemoteExecutor};

const TAILSCALE_INSTALL_URL: &str = "https://tailscale.com/install.sh";
/// Lines of command output kept in a [`RemoteError::CommandFailed`].
const FAILURE_OUTPUT_LINES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("cannot reach {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Ssh(#[from] ssh2::Error),

    #[error("{address} presented no usable host key")]
    NoHostKey { address: String },

    #[error("host key of {address} does not match known_hosts ({check:?})")]
    HostKey { address: String, check: HostKeyCheck },

    #[error("{user}@{address} rejected the node key")]
    AuthRejected { user: String, address: String },

    #[error("`{label}` exited with status {status}: {output}")]
    CommandFailed {
        label: &'static str,
        status: i32,
        /// Tail of the merged stdout/stderr stream.
        output: String,
    },

    #[error("ssh channel io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Keys(#[from] KeyError),
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Upper bound on any single blocking session operation.
    pub command_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
        }
    }
}

/// One remote command with a log-safe label.
#[derive(Clone, PartialEq, Eq)]
pub struct SetupCommand {
    pub label: &'static str,
    pub command: String,
}

impl std::fmt::Debug for SetupCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupCommand").field("label", &self.label).finish_non_exhaustive()
    }
}

/// The commands that install the VPN agent and join the mesh, in order.
pub fn setup_commands(setup: &AgentSetup) -> Vec<SetupCommand> {
    let mut up = format!(
        "sudo tailscale up --auth-key {} --hostname {}",
        shell_quote(&setup.auth_token),
        shell_quote(&setup.hostname)
    );
    if setup.exit_node {
        up.push_str(" --advertise-exit-node");
    }

    vec![
        SetupCommand {
            label: "install tailscale",
            command: format!("curl -fsSL {TAILSCALE_INSTALL_URL} | sh"),
        },
        SetupCommand {
            label: "enable ipv4 forwarding",
            command: "echo 'net.ipv4.ip_forward = 1' | sudo tee -a /etc/sysctl.conf".to_string(),
        },
        SetupCommand {
            label: "enable ipv6 forwarding",
            command: "echo 'net.ipv6.conf.all.forwarding = 1' | sudo tee -a /etc/sysctl.conf"
                .to_string(),
        },
        SetupCommand {
            label: "reload sysctl",
            command: "sudo sysctl -p /etc/sysctl.conf".to_string(),
        },
        SetupCommand {
            label: "tailscale up",
            command: up,
        },
    ]
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `known_hosts` host field: bare address on port 22, `[address]:port` otherwise.
pub fn host_label(address: &str, port: u16) -> String {
    if port == 22 {
        address.to_string()
    } else {
        format!("[{address}]:{port}")
    }
}

fn key_type_name(kind: HostKeyType) -> Option<&'static str> {
    match kind {
        HostKeyType::Rsa => Some("ssh-rsa"),
        HostKeyType::Dss => Some("ssh-dss"),
        HostKeyType::Ecdsa256 => Some("ecdsa-sha2-nistp256"),
        HostKeyType::Ecdsa384 => Some("ecdsa-sha2-nistp384"),
        HostKeyType::Ecdsa521 => Some("ecdsa-sha2-nistp521"),
        HostKeyType::Ed25519 => Some("ssh-ed25519"),
        _ => None,
    }
}

// ─── Executor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SshExecutor {
    settings: SshSettings,
    known_hosts: KnownHosts,
}

impl SshExecutor {
    pub fn new(settings: SshSettings, known_hosts: KnownHosts) -> Self {
        Self {
            settings,
            known_hosts,
        }
    }

    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }

    fn connect(&self, address: &str) -> Result<Session, RemoteError> {
        let connect_err = |source: std::io::Error| RemoteError::Connect {
            address: address.to_string(),
            source,
        };
        let socket = (address, self.settings.port)
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "address resolved to nothing",
                ))
            })?;
        let tcp = TcpStream::connect_timeout(&socket, self.settings.connect_timeout)
            .map_err(connect_err)?;

        let mut session = Session::new()?;
        let timeout_ms = u32::try_from(self.settings.command_timeout.as_millis()).unwrap_or(u32::MAX);
        session.set_timeout(timeout_ms);
        session.set_tcp_stream(tcp);
        session.handshake()?;
        debug!(address, port = self.settings.port, "ssh handshake complete");
        Ok(session)
    }

    fn host_key(session: &Session, address: &str) -> Result<(&'static str, Vec<u8>), RemoteError> {
        session
            .host_key()
            .and_then(|(key, kind)| key_type_name(kind).map(|name| (name, key.to_vec())))
            .ok_or_else(|| RemoteError::NoHostKey {
                address: address.to_string(),
            })
    }

    fn authenticate(
        &self,
        session: &Session,
        address: &str,
        key: &StoredKeyPair,
    ) -> Result<(), RemoteError> {
        session.userauth_pubkey_file(
            &self.settings.user,
            Some(key.public_key_path.as_path()),
            &key.private_key_path,
            None,
        )?;
        if !session.authenticated() {
            return Err(RemoteError::AuthRejected {
                user: self.settings.user.clone(),
                address: address.to_string(),
            });
        }
        Ok(())
    }

    fn run(session: &Session, command: &SetupCommand) -> Result<(), RemoteError> {
        let mut channel = session.channel_session()?;
        // stderr arrives interleaved on the stdout stream.
        channel.handle_extended_data(ExtendedData::Merge)?;
        channel.exec(&command.command)?;

        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        channel.wait_close()?;

        let status = channel.exit_status()?;
        if status != 0 {
            return Err(RemoteError::CommandFailed {
                label: command.label,
                status,
                output: output_tail(&output, FAILURE_OUTPUT_LINES),
            });
        }
        debug!(label = command.label, output_bytes = output.len(), "remote command finished");
        Ok(())
    }

    fn record_blocking(&self, address: &str, key: &StoredKeyPair) -> Result<(), RemoteError> {
        let session = self.connect(address)?;
        let (key_type, host_key) = Self::host_key(&session, address)?;
        self.authenticate(&session, address, key)?;
        self.known_hosts
            .record(&host_label(address, self.settings.port), key_type, &host_key)?;
        Ok(())
    }

    fn setup_blocking(
        &self,
        address: &str,
        key: &StoredKeyPair,
        setup: &AgentSetup,
    ) -> Result<(), RemoteError> {
        let session = self.connect(address)?;
        let (key_type, host_key) = Self::host_key(&session, address)?;
        let check = self.known_hosts.check(
            &host_label(address, self.settings.port),
            key_type,
            &host_key,
        )?;
        if check != HostKeyCheck::Match {
            return Err(RemoteError::HostKey {
                address: address.to_string(),
                check,
            });
        }
        self.authenticate(&session, address, key)?;

        for command in setup_commands(setup) {
            info!(address, step = command.label, "running remote setup");
            Self::run(&session, &command)?;
        }
        Ok(())
    }
}

async fn blocking<T, F>(operation: &'static str, f: F) -> ProvisionResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProvisionError::remote(operation, e))?
        .map_err(|e| ProvisionError::remote(operation, e))
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn record_host_identity(&self, address: &str, key: &StoredKeyPair) -> ProvisionResult<()> {
        let this = self.clone();
        let address = address.to_string();
        let key = key.clone();
        blocking("record host identity", move || this.record_blocking(&address, &key)).await
    }

    async fn run_remote_setup(
        &self,
        address: &str,
        key: &StoredKeyPair,
        setup: &AgentSetup,
    ) -> ProvisionResult<()> {
        let this = self.clone();
        let host = address.to_string();
        let key = key.clone();
        let agent = setup.clone();
        blocking("remote setup", move || this.setup_blocking(&host, &key, &agent)).await?;
        info!(address, hostname = %setup.hostname, "VPN agent enrolled");
        Ok(())
    }
}

/// The last `lines` non-empty lines of `output`.
fn output_tail(output: &str, lines: usize) -> String {
    let kept: Vec<&str> = output
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();
    kept[kept.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(exit_node: bool) -> AgentSetup {
        AgentSetup {
            hostname: "007-eu-west-1-t2.micro".into(),
            auth_token: "tskey-auth-secret".into(),
            exit_node,
        }
    }

    #[test]
    fn test_setup_commands_in_order() {
        let commands = setup_commands(&setup(false));
        let labels: Vec<&str> = commands.iter().map(|c| c.label).collect();
        assert_eq!(
            labels,
            vec![
                "install tailscale",
                "enable ipv4 forwarding",
                "enable ipv6 forwarding",
                "reload sysctl",
                "tailscale up"
            ]
        );
        assert_eq!(commands[0].command, "curl -fsSL https://tailscale.com/install.sh | sh");
        assert_eq!(
            commands[4].command,
            "sudo tailscale up --auth-key 'tskey-auth-secret' --hostname '007-eu-west-1-t2.micro'"
        );
    }

    #[test]
    fn test_exit_node_flag_appended() {
        let commands = setup_commands(&setup(true));
        let last = commands.last().expect("tailscale up");
        assert!(last.command.ends_with(" --advertise-exit-node"));
    }

    #[test]
    fn test_debug_hides_command_text() {
        let commands = setup_commands(&setup(false));
        let debug = format!("{commands:?}");
        assert!(!debug.contains("tskey-auth-secret"));
        assert!(debug.contains("tailscale up"));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn test_output_tail_keeps_last_lines() {
        let output: String = (1..=30).map(|i| format!("line {i}\n")).collect();
        let tail = output_tail(&output, 3);
        assert_eq!(tail, "line 28\nline 29\nline 30");
        assert_eq!(output_tail("E: boom\n\n", 20), "E: boom");
        assert_eq!(output_tail("", 20), "");
    }

    #[test]
    fn test_host_label() {
        assert_eq!(host_label("203.0.113.7", 22), "203.0.113.7");
        assert_eq!(host_label("203.0.113.7", 2222), "[203.0.113.7]:2222");
    }

    #[test]
    fn test_key_type_names() {
        assert_eq!(key_type_name(HostKeyType::Ed25519), Some("ssh-ed25519"));
        assert_eq!(key_type_name(HostKeyType::Ecdsa256), Some("ecdsa-sha2-nistp256"));
        assert_eq!(key_type_name(HostKeyType::Unknown), None);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_remote_call_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let dir = tempfile::tempdir().expect("tempdir");
        let executor = SshExecutor::new(
            SshSettings {
                port,
                connect_timeout: Duration::from_secs(2),
                ..SshSettings::default()
            },
            KnownHosts::new(dir.path().join("known_hosts")),
        );
        let key = StoredKeyPair {
            name: "n".into(),
            private_key_path: dir.path().join("n.pem"),
            public_key_path: dir.path().join("n.pub"),
            public_key: String::new(),
        };

        let err = executor
            .record_host_identity("127.0.0.1", &key)
            .await
            .expect_err("refused");
        assert!(matches!(
            err,
            ProvisionError::RemoteCall { operation: "record host identity", .. }
        ));
        assert!(!dir.path().join("known_hosts").exists());
    }
}
