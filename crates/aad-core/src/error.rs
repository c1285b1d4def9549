use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("metrics query failed: {0}")]
    Metrics(String),

    #[error("unexpected metrics result: {0}")]
    MetricsFormat(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    #[error("no service matching '{0}' found")]
    ServiceNotFound(String),

    #[error("service '{0}' has no usable spec")]
    InvalidServiceSpec(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
