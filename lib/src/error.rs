use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no instance type {instance_type} known in {region}")]
    UnknownInstanceType {
        region: String,
        instance_type: String,
    },
    #[error("{0} is not a selectable region")]
    NoSuchRegion(String),
    #[error("exhausted {0} attempts")]
    ExhaustedAttempts(usize),
    #[error("wait was cancelled")]
    Cancelled,
    #[error("cloud reply was missing {0}")]
    MissingLaunchData(&'static str),
    #[error("instance {instance_id} never registered with the cluster")]
    RegistrationTimeout { instance_id: String },
    #[error("task never reached RUNNING")]
    WorkloadStartFailed,
    #[error("unknown error")]
    Unknown,
}
