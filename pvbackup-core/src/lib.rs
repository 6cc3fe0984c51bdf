//! Shared cluster client facade, pod monitor, hook executor, retention
//! engine and resource tracking used by the snapshot controller, backup
//! controller and backup runner binaries.

pub mod config;
pub mod error;
pub mod hooks;
pub mod k8s;
pub mod monitor;
pub mod retention;
pub mod signal;
pub mod tracked;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use k8s::K8sClient;
pub use tracked::{ResourceId, ResourceKind, TrackedResources};
