use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration directory not found")]
    ConfigDirNotFound,

    #[error(
        "configuration file not found. Looked in:\n\
        - the FLOWGATE_CONFIG environment variable\n\
        - the current directory: flowgate.local.kdl, flowgate.kdl\n\
        - the ./.flowgate/ directory\n\
        - ~/.config/flowgate/flowgate.kdl"
    )]
    NotFound,

    #[error("KDL parse error: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
