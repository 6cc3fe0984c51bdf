use thiserror::Error;

/// Errors shared by the snapshot controller, backup controller and backup runner
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes api error")]
    Kube(#[from] kube::Error),
    /// The configuration blob failed validation
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A bounded wait exceeded its deadline
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// A hook exited non-zero or the target pod/container could not be found
    #[error("hook failed: {0}")]
    Hook(String),
    /// The repository tool reported a failure
    #[error("repository error: {0}")]
    Repo(String),
    /// Failed to read or parse the mounted config file
    #[error("failed to load config: {0}")]
    Load(#[from] std::io::Error),
}

/// Convenience result alias
pub type Result<T> = std::result::Result<T, Error>;
