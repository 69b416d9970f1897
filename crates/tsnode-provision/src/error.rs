use std::fmt;
use tsnode_identity::KeyError;
use tsnode_state::StateError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which input a [`ProvisionError::InvalidParameter`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Region,
    InstanceType,
    Image,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParameterKind::Region => "region",
            ParameterKind::InstanceType => "instance type",
            ParameterKind::Image => "image",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Local state failure, including a missing node record.
    #[error(transparent)]
    State(#[from] StateError),

    /// Local key-file failure.
    #[error(transparent)]
    Keys(#[from] KeyError),

    #[error("invalid {kind}: {message}")]
    InvalidParameter { kind: ParameterKind, message: String },

    /// A remote resource looked up by id or name does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{operation}: expected {expected} result(s), provider reported {actual}")]
    UnexpectedCardinality {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{operation} failed: {source}")]
    RemoteCall {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("instance {instance_id} failed to boot: {reason}")]
    BootFailed { instance_id: String, reason: String },
}

impl ProvisionError {
    pub fn remote(operation: &'static str, source: impl Into<BoxError>) -> Self {
        Self::RemoteCall {
            operation,
            source: source.into(),
        }
    }

    pub fn invalid(kind: ParameterKind, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            kind,
            message: message.into(),
        }
    }

    /// True for both a missing local record and a missing remote resource.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProvisionError::NotFound { .. } | ProvisionError::State(StateError::NotFound(_))
        )
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

// ─── Saga steps ──────────────────────────────────────────────────────────────

/// A step of the `up` or `down` saga. Failures carry the step they stopped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AllocateRecord,
    GenerateKeys,
    ImportKeys,
    CreateIngressPolicy,
    LaunchInstance,
    AwaitBoot,
    ResolveAddress,
    RecordHostIdentity,
    Bootstrap,
    LoadRecord,
    FindInstance,
    TerminateInstance,
    AwaitTermination,
    DeleteIngressPolicy,
    DeleteRemoteKeys,
    DeleteLocalKeys,
    RemoveRecord,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::AllocateRecord => "allocate node record",
            Step::GenerateKeys => "generate access keys",
            Step::ImportKeys => "import access key",
            Step::CreateIngressPolicy => "create ingress policy",
            Step::LaunchInstance => "launch instance",
            Step::AwaitBoot => "wait for instance boot",
            Step::ResolveAddress => "resolve public address",
            Step::RecordHostIdentity => "record host identity",
            Step::Bootstrap => "bootstrap VPN agent",
            Step::LoadRecord => "load node record",
            Step::FindInstance => "find instance",
            Step::TerminateInstance => "terminate instance",
            Step::AwaitTermination => "wait for instance termination",
            Step::DeleteIngressPolicy => "delete ingress policy",
            Step::DeleteRemoteKeys => "delete remote access key",
            Step::DeleteLocalKeys => "delete local access keys",
            Step::RemoveRecord => "remove node record",
        })
    }
}

/// A saga stopped at `step`. Nothing completed before it is rolled back.
#[derive(Debug, thiserror::Error)]
#[error("{step}")]
pub struct SagaError {
    pub step: Step,
    #[source]
    pub source: ProvisionError,
}

pub(crate) trait StepExt<T> {
    fn at(self, step: Step) -> Result<T, SagaError>;
}

impl<T, E: Into<ProvisionError>> StepExt<T> for Result<T, E> {
    fn at(self, step: Step) -> Result<T, SagaError> {
        self.map_err(|e| SagaError {
            step,
            source: e.into(),
        })
    }
}
