use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network graph contains a cycle: {0}")]
    CyclicGraph(String),

    #[error("port connection error: {0}")]
    PortConnection(String),

    #[error("processor not found: {0}")]
    ProcessorNotFound(String),

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("property not found: {0}")]
    PropertyNotFound(String),

    #[error("property link error: {0}")]
    PropertyLink(String),

    #[error("render target error: {0}")]
    RenderTarget(String),

    #[error("graphics context error: {0}")]
    Graphics(String),

    #[error("processor failed: {0}")]
    Processor(String),

    #[error("network file error: {0}")]
    NetworkFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
