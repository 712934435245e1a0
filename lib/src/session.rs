use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info};
use tokio::sync::Notify;

use crate::catalog::Catalog;
use crate::cluster;
use crate::config::SpawnerConfig;
use crate::ec2;
use crate::error::Error;
use crate::progress::{ProgressCursor, ProgressLog};
use crate::task;
use crate::types::{PollStatus, SessionState, SpawnRequest};

/// One user's provisioning session: the explicit record of everything
/// the stages produce, plus the progress log the host UI streams from.
///
/// Stages run strictly in sequence; every cloud wait suspends
/// cooperatively, so any number of sessions can run side by side on one
/// runtime.
pub struct Session {
    config: SpawnerConfig,
    catalog: Catalog,
    request: SpawnRequest,
    inherited_env: HashMap<String, String>,
    state: SessionState,
    progress: ProgressLog,
    cancel: Arc<Notify>,
    instance_id: Option<String>,
    container_instance_arn: Option<String>,
    task_definition_arn: Option<String>,
    ip: Option<String>,
}

impl Session {
    pub fn new(config: SpawnerConfig, catalog: Catalog, request: SpawnRequest) -> Self {
        Session {
            config,
            catalog,
            request,
            inherited_env: HashMap::new(),
            state: SessionState::Idle,
            progress: ProgressLog::new(),
            cancel: Arc::new(Notify::new()),
            instance_id: None,
            container_instance_arn: None,
            task_definition_arn: None,
            ip: None,
        }
    }

    /// Environment the host wants handed through to the container, e.g.
    /// the hub API url and token. Merged below the computed keys.
    pub fn with_inherited_env(mut self, env: HashMap<String, String>) -> Self {
        self.inherited_env = env;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// The cluster's handle for this session's node, once registered.
    pub fn cluster_node(&self) -> Option<&str> {
        self.container_instance_arn.as_deref()
    }

    /// Address/port tuple the host hands to the user once the session
    /// runs.
    pub fn address(&self) -> Option<(&str, u16)> {
        self.ip.as_deref().map(|ip| (ip, task::NOTEBOOK_PORT))
    }

    /// A fresh, restartable progress stream over this session's log. It
    /// never ends on its own; the consumer cancels it.
    pub fn progress(&self) -> ProgressCursor {
        self.progress.cursor()
    }

    /// Handle the host can fire to abort a pending registration wait;
    /// `start` then fails with `Error::Cancelled`. The launch and
    /// workload stages are not interrupted.
    pub fn cancel_handle(&self) -> Arc<Notify> {
        self.cancel.clone()
    }

    /// Drives the session from Idle to Running: launch, registration
    /// wait, workload start, strictly in that order.
    ///
    /// Launch failures propagate untouched. When registration or the
    /// workload start comes back tagged as failed, the orphaned instance
    /// is terminated before the error surfaces, so a failed start never
    /// leaves a billable machine idling in the cluster.
    pub async fn start(&mut self) -> Result<(String, u16)> {
        self.state = SessionState::Launching;
        let instance = ec2::launch(&self.config, &self.catalog, &self.request, &self.progress).await?;
        self.instance_id = Some(instance.id.clone());
        self.ip = Some(instance.ip.clone());
        info!("Finished spawning EC2");

        self.state = SessionState::AwaitingRegistration;
        let node = cluster::wait_for_registration(
            &self.config,
            &instance.id,
            &self.request.user,
            &self.request.region,
            &self.progress,
            Some(self.cancel.as_ref()),
        )
        .await?;
        let node = match node {
            Some(node) => node,
            None => {
                self.reclaim().await;
                return Err(Error::RegistrationTimeout {
                    instance_id: instance.id,
                }
                .into());
            }
        };
        self.container_instance_arn = Some(node.container_instance_arn.clone());

        self.state = SessionState::RegisteringWorkload;
        let task_definition_arn = task::register_and_start(
            &self.config,
            &self.catalog,
            &self.request,
            &node,
            &self.inherited_env,
            &self.progress,
        )
        .await?;
        match task_definition_arn {
            Some(arn) => {
                self.task_definition_arn = Some(arn);
                self.state = SessionState::Running;
                Ok((instance.ip, task::NOTEBOOK_PORT))
            }
            None => {
                self.reclaim().await;
                Err(Error::WorkloadStartFailed.into())
            }
        }
    }

    /// The host's liveness poll: `Running` iff a workload handle exists.
    /// No re-check against the cluster.
    pub async fn poll(&self) -> PollStatus {
        if self.task_definition_arn.is_none() {
            PollStatus::Stopped
        } else {
            PollStatus::Running
        }
    }

    /// Terminates the session's instance and waits for confirmation.
    /// Safe at any point in the lifecycle; without an instance it is a
    /// no-op. Does not interrupt a stage that is still in flight.
    pub async fn stop(&mut self) -> Result<()> {
        debug!("Starting stop method");
        match self.instance_id.clone() {
            Some(instance_id) => {
                self.state = SessionState::Stopping;
                info!("Terminating instance {}", instance_id);
                ec2::terminate(&self.request.region, &instance_id).await?;
                info!("Instance {} terminated", instance_id);
                self.instance_id = None;
                self.container_instance_arn = None;
                self.task_definition_arn = None;
                self.ip = None;
                self.state = SessionState::Terminated;
            }
            None => debug!("Stop called when no instance was created"),
        }
        Ok(())
    }

    /// Compensation path for a half-provisioned session: the instance is
    /// up but no workload will ever reach it. A failed reclaim is logged
    /// and swallowed; the stage error is the one worth surfacing.
    async fn reclaim(&mut self) {
        if let Err(err) = self.stop().await {
            error!("unable to reclaim orphaned instance: {:#}", err);
        }
    }
}
