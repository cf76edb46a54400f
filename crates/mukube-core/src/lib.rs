//! # mukube-core
//!
//! Core library for mukube - a supervisor that boots a single-node Kubernetes
//! control plane from externally provided binaries (etcd, kube-apiserver,
//! kube-controller-manager, kube-scheduler, kubelet, kube-proxy).
//!
//! This crate provides the building blocks the daemon composes:
//!
//! - **Process management**: spawn child daemons in their own process group,
//!   stream their output and observe their exit
//! - **Supervision**: one supervisor per daemon with health probing and a
//!   bounded restart budget
//! - **Credentials**: an on-disk RSA PKI with four CAs plus the service
//!   account signing key, materialised lazily
//! - **Network planning**: bind address selection and cluster CIDR derivation
//!   from the pod and service ranges
//! - **Log normalisation**: etcd-style and klog-style child output parsed
//!   into one structured log stream
//!
//! ## Example
//!
//! ```rust,no_run
//! use mukube_core::health::BodyValidator;
//! use mukube_core::supervisor::ServiceSpec;
//!
//! let spec = ServiceSpec::builder()
//!     .name("etcd")
//!     .command("/opt/third_party/etcd")
//!     .args(["--data-dir", "/var/lib/mukube/etcddata"])
//!     .health_url("https://localhost:7000/health")
//!     .validator(BodyValidator::EtcdJson)
//!     .build();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod credentials;
pub mod env;
pub mod health;
pub mod logparse;
pub mod network;
pub mod pki;
pub mod process;
pub mod supervisor;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::credentials::ClusterCredentials;
    pub use crate::env::{ExecutionEnvironment, PortTable};
    pub use crate::health::{BodyValidator, HealthMessage, ProbeTls};
    pub use crate::network::NetworkPlan;
    pub use crate::supervisor::{ServiceSpec, Supervisor};
}

pub use credentials::ClusterCredentials;
pub use env::ExecutionEnvironment;
pub use health::HealthMessage;
pub use network::NetworkPlan;
pub use supervisor::{ServiceSpec, Supervisor};
