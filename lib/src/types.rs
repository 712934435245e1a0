use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};

/// What one user asked for. Frozen once the session starts.
#[derive(Clone, Debug)]
pub struct SpawnRequest {
    pub user: String,
    pub instance_type: String,
    pub region: String,
    pub spot: bool,
    /// Root volume size override in GiB.
    pub volume: Option<i64>,
    /// Docker image override.
    pub image: Option<String>,
}

impl SpawnRequest {
    /// Builds a request from the submitted selection-form fields. The
    /// `spot` field counts by presence only; empty `volume` and `image`
    /// strings mean "no override".
    pub fn from_form(user: &str, form: &HashMap<String, Vec<String>>) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            form.get(name)
                .and_then(|values| values.first())
                .cloned()
                .ok_or_else(|| anyhow!("form field {} is missing", name))
        };

        let volume = field("volume")?;
        let volume = if volume.is_empty() {
            None
        } else {
            Some(
                volume
                    .parse()
                    .with_context(|| format!("{} is not a volume size", volume))?,
            )
        };
        let image = Some(field("image")?).filter(|image| !image.is_empty());

        Ok(SpawnRequest {
            user: user.to_string(),
            instance_type: field("instance")?,
            region: field("region")?,
            spot: form.contains_key("spot"),
            volume,
            image,
        })
    }
}

/// The machine leased for one session.
#[derive(Clone, Debug)]
pub struct Ec2Instance {
    pub id: String,
    pub ip: String,
}

/// The cluster's registration record for an instance, with the capacity
/// snapshot taken the moment it appeared. Never re-read afterwards; the
/// workload requests exactly these figures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRegistration {
    pub container_instance_arn: String,
    pub cpu: i64,
    pub memory: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Launching,
    AwaitingRegistration,
    RegisteringWorkload,
    Running,
    Stopping,
    Terminated,
}

/// Answer to the host's liveness poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    Stopped,
    Running,
}
