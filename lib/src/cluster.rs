use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use rusoto_core::Region;
use tokio::sync::Notify;
use rusoto_ecs::{
    Attribute, ContainerInstance, DescribeContainerInstancesRequest, Ecs, EcsClient,
    ListContainerInstancesRequest, PutAttributesRequest,
};

use crate::config::SpawnerConfig;
use crate::error::Error;
use crate::progress::ProgressLog;
use crate::retry::RetryPolicy;
use crate::types::NodeRegistration;

// The ECS agent typically joins within seconds of the instance running;
// 50 one-second polls is the whole budget, no backoff.
const REGISTRATION_ATTEMPTS: usize = 50;

pub(crate) fn ecs_client(region: &str) -> Result<EcsClient> {
    let region = Region::from_str(region).with_context(|| format!("Region {} not found", region))?;
    Ok(EcsClient::new(region))
}

/// Polls the cluster until the freshly launched instance shows up as a
/// registered node, then pins the owner attribute on it.
///
/// `Ok(None)` is the tagged registration-timeout outcome: the budget ran
/// out without a match, a warning was logged, and it is the caller's
/// call whether to keep or reclaim the still-running instance.
///
/// A `cancel` Notify, when given, aborts the wait with `Error::Cancelled`
/// as soon as it fires.
pub async fn wait_for_registration(
    config: &SpawnerConfig,
    instance_id: &str,
    user: &str,
    region: &str,
    progress: &ProgressLog,
    cancel: Option<&Notify>,
) -> Result<Option<NodeRegistration>> {
    progress.append("Waiting for instance to appear in ECS cluster");
    let client = ecs_client(region)?;

    let policy = RetryPolicy::new(REGISTRATION_ATTEMPTS, Duration::from_secs(1));
    let client_ref = &client;
    let cluster_name = config.ecs_cluster.as_str();
    let attempt = move || find_registered_node(client_ref, cluster_name, instance_id);
    let node = match cancel {
        Some(cancel) => policy.run_until_cancelled(attempt, cancel).await?,
        None => policy.run(attempt).await?,
    };

    let node = match node {
        Some(node) => node,
        None => {
            warn!("Did not find container instance for {}", instance_id);
            return Ok(None);
        }
    };
    info!("Found container instance for {}", instance_id);

    tag_owner(&client, &config.ecs_cluster, &node.container_instance_arn, user).await?;
    Ok(Some(node))
}

/// One polling attempt. An empty node list and a list without our
/// instance both count as "not registered yet".
async fn find_registered_node(
    client: &EcsClient,
    cluster: &str,
    instance_id: &str,
) -> Result<Option<NodeRegistration>> {
    let arns = client
        .list_container_instances(ListContainerInstancesRequest {
            cluster: Some(cluster.to_string()),
            ..Default::default()
        })
        .await
        .context("unable to list cluster nodes")?
        .container_instance_arns
        .unwrap_or_default();
    if arns.is_empty() {
        return Ok(None);
    }

    let nodes = client
        .describe_container_instances(DescribeContainerInstancesRequest {
            cluster: Some(cluster.to_string()),
            container_instances: arns,
            ..Default::default()
        })
        .await
        .context("unable to describe cluster nodes")?
        .container_instances
        .unwrap_or_default();

    for node in nodes {
        if node.ec_2_instance_id.as_deref() == Some(instance_id) {
            return capacity_snapshot(node).map(Some);
        }
    }
    Ok(None)
}

/// Reads the node's remaining CPU/memory advertisement once, at
/// registration time. The workload will request exactly these figures.
fn capacity_snapshot(node: ContainerInstance) -> Result<NodeRegistration> {
    let container_instance_arn = node
        .container_instance_arn
        .ok_or(Error::MissingLaunchData("a container instance ARN"))?;

    let mut cpu = 0;
    let mut memory = 0;
    for resource in node.remaining_resources.unwrap_or_default() {
        match resource.name.as_deref() {
            Some("CPU") => cpu = resource.integer_value.unwrap_or(0),
            Some("MEMORY") => memory = resource.integer_value.unwrap_or(0),
            _ => {}
        }
    }

    Ok(NodeRegistration {
        container_instance_arn,
        cpu,
        memory,
    })
}

async fn tag_owner(
    client: &EcsClient,
    cluster: &str,
    container_instance_arn: &str,
    user: &str,
) -> Result<()> {
    client
        .put_attributes(PutAttributesRequest {
            cluster: Some(cluster.to_string()),
            attributes: vec![Attribute {
                name: "jupyter-owner".to_string(),
                value: Some(user.to_string()),
                target_id: Some(container_instance_arn.to_string()),
                ..Default::default()
            }],
        })
        .await
        .context("unable to set the owner attribute on the cluster node")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rusoto_ecs::Resource;

    use crate::config::test_config;

    use super::*;

    fn resource(name: &str, value: i64) -> Resource {
        Resource {
            name: Some(name.to_string()),
            integer_value: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn the_capacity_snapshot_reads_cpu_and_memory() {
        let node = ContainerInstance {
            container_instance_arn: Some("arn:aws:ecs:us-east-1:1:container-instance/abc".into()),
            ec_2_instance_id: Some("i-0123456789abcdef0".into()),
            remaining_resources: Some(vec![
                resource("CPU", 2048),
                resource("MEMORY", 4096),
                resource("PORTS", 5),
            ]),
            ..Default::default()
        };

        let snapshot = capacity_snapshot(node).unwrap();
        assert_eq!(
            snapshot,
            NodeRegistration {
                container_instance_arn: "arn:aws:ecs:us-east-1:1:container-instance/abc".into(),
                cpu: 2048,
                memory: 4096,
            }
        );
    }

    #[test]
    fn a_node_without_an_arn_is_an_error() {
        let node = ContainerInstance::default();
        assert!(capacity_snapshot(node).is_err());
    }

    #[tokio::test]
    async fn a_fired_cancel_aborts_the_registration_wait() {
        let cancel = Notify::new();
        cancel.notify_one();
        let progress = ProgressLog::new();

        let err = wait_for_registration(
            &test_config(),
            "i-0123456789abcdef0",
            "bob",
            "us-east-1",
            &progress,
            Some(&cancel),
        )
        .await
        .unwrap_err();

        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled)));
        assert_eq!(progress.len(), 1);
    }
}
