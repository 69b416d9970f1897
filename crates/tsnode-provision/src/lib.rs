//! Provisioning for tsnode.
//!
//! [`ComputeProvider`] is the seam to the cloud (EC2 via [`Ec2Provider`]),
//! [`RemoteExecutor`] the seam to the launched host. [`NodeLifecycle`] drives
//! both through the `up` and `down` sagas, polling with [`Poller`] while the
//! instance boots or terminates.

#![forbid(unsafe_code)]

pub mod ec2;
pub mod error;
pub mod lifecycle;
pub mod provider;
pub mod readiness;
pub mod resolver;
mod sigv4;

pub use ec2::{AwsCredentials, Ec2Error, Ec2Provider, Ec2Settings};
pub use error::{BoxError, ParameterKind, ProvisionError, ProvisionResult, SagaError, Step};
pub use lifecycle::{DecommissionedNode, NodeLifecycle, ProvisionedNode, UpRequest};
pub use provider::{
    AgentSetup, BootStatus, ComputeProvider, InstanceDescriptor, LaunchSpec, RemoteExecutor,
    STATE_TERMINATED,
};
pub use readiness::{BootReadiness, BootState, Poller, Progress, Readiness, TerminationReadiness};
pub use resolver::{LaunchParameters, ParameterFlags, ParameterResolver};
