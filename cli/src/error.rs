use esn_core::RegionError;
use esn_guest::GuestError;
use esn_host::HostError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("guest error: {0}")]
    Guest(#[from] GuestError),

    #[error("region error: {0}")]
    Region(#[from] RegionError),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("simulation stalled: {0}")]
    Stalled(String),

    #[error("scenario {scenario} failed: {reason}")]
    ScenarioFailed {
        scenario: &'static str,
        reason: String,
    },
}
