use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch of '{repo}' failed: {reason}")]
    Fetch { repo: String, reason: String },

    #[error("submodule rewrite failed: {0}")]
    Rewrite(String),

    #[error("configure failed in {stage}: {reason}")]
    Configure { stage: String, reason: String },

    #[error("compile failed in {stage}: {reason}")]
    Compile { stage: String, reason: String },

    #[error("install failed in {stage}: {reason}")]
    Install { stage: String, reason: String },

    #[error("invalid choice '{0}'")]
    PlanResolution(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Msg(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    /// Short machine-readable tag used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Fetch { .. } => "fetch",
            Error::Rewrite(_) => "rewrite",
            Error::Configure { .. } => "configure",
            Error::Compile { .. } => "compile",
            Error::Install { .. } => "install",
            Error::PlanResolution(_) => "plan",
            Error::Config(_) => "config",
            Error::Msg(_) => "other",
            Error::Io(_) => "io",
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
