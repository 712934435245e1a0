use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};
use regex::Regex;
use rusoto_ecs::{
    ContainerDefinition, DescribeTasksRequest, Ecs, EcsClient, KeyValuePair,
    RegisterTaskDefinitionRequest, StartTaskRequest,
};

use crate::catalog::Catalog;
use crate::cluster::ecs_client;
use crate::config::SpawnerConfig;
use crate::error::Error;
use crate::progress::ProgressLog;
use crate::retry::RetryPolicy;
use crate::types::{NodeRegistration, SpawnRequest};

pub const NOTEBOOK_PORT: u16 = 8888;

const DEFAULT_S3_PREFIX: &str = "notebooks";

/// Task-definition family for a user. Deterministic: the same identity
/// always maps to the same family, anything outside `[a-zA-Z0-9_-]`
/// becomes an underscore.
pub fn task_family(user: &str) -> String {
    let sanitized = Regex::new("[^a-zA-Z0-9_-]")
        .expect("family pattern is valid")
        .replace_all(user, "_");
    format!("jupyter-task-{}", sanitized)
}

/// The allow-listed users get the operator's task role, everyone else
/// the fallback role.
pub fn task_role<'a>(config: &'a SpawnerConfig, user: &str) -> &'a str {
    if config.task_role_users.iter().any(|name| name == user) {
        &config.task_role_arn
    } else {
        &config.default_task_role_arn
    }
}

/// Container image for the session: the request override when given,
/// else the accelerator or standard default for the instance type.
pub fn container_image(
    config: &SpawnerConfig,
    catalog: &Catalog,
    request: &SpawnRequest,
) -> Result<String> {
    if let Some(image) = &request.image {
        return Ok(image.clone());
    }
    let spec = catalog.instance(&request.region, &request.instance_type)?;
    Ok(if spec.gpu {
        config.default_docker_image_gpu.clone()
    } else {
        config.default_docker_image.clone()
    })
}

/// Environment handed to the container. Merge order matters: computed
/// keys first, then the operator's custom environment on top, and
/// finally the per-user storage prefix, which always wins.
pub fn container_environment(
    user: &str,
    inherited: &HashMap<String, String>,
    custom_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = inherited.clone();
    env.insert("GRANT_SUDO".to_string(), "yes".to_string());
    env.insert("NB_USER".to_string(), user.to_string());
    env.insert("CHOWN_HOME".to_string(), "yes".to_string());
    env.insert("JUPYTER_ENABLE_LAB".to_string(), "yes".to_string());

    for (key, value) in custom_env {
        env.insert(key.clone(), value.clone());
    }

    let prefix_root = custom_env
        .get("S3_PREFIX")
        .map(String::as_str)
        .unwrap_or(DEFAULT_S3_PREFIX);
    env.insert("S3_PREFIX".to_string(), format!("{}/{}", prefix_root, user));

    env
}

/// The immutable workload specification for one registration: host
/// networking, resources pinned to the node's capacity snapshot, root
/// container user, fixed startup command.
fn container_definition(
    family: &str,
    image: String,
    user: &str,
    node: &NodeRegistration,
    env: HashMap<String, String>,
) -> ContainerDefinition {
    let environment = env
        .into_iter()
        .map(|(name, value)| KeyValuePair {
            name: Some(name),
            value: Some(value),
        })
        .collect();

    ContainerDefinition {
        name: Some(family.to_string()),
        image: Some(image),
        cpu: Some(node.cpu),
        memory: Some(node.memory),
        environment: Some(environment),
        user: Some("root".to_string()),
        working_directory: Some(format!("/home/{}", user)),
        command: Some(vec![
            "start-singleuser.sh".to_string(),
            format!("--port={}", NOTEBOOK_PORT),
            "--SingleUserNotebookApp.default_url=/lab".to_string(),
        ]),
        ..Default::default()
    }
}

/// Registers a fresh task-definition revision for the user and starts it
/// on the discovered node.
///
/// Registration and start failures propagate; a failure while waiting
/// for the task to report RUNNING is logged and yields `Ok(None)`, the
/// tagged workload-start-failure outcome.
pub async fn register_and_start(
    config: &SpawnerConfig,
    catalog: &Catalog,
    request: &SpawnRequest,
    node: &NodeRegistration,
    inherited_env: &HashMap<String, String>,
    progress: &ProgressLog,
) -> Result<Option<String>> {
    let client = ecs_client(&request.region)?;

    let image = container_image(config, catalog, request)?;
    info!("Using docker image {}", image);
    info!("Creating ECS task");
    progress.append("Creating ECS task");

    let family = task_family(&request.user);
    let env = container_environment(&request.user, inherited_env, &config.custom_env);
    let definition = container_definition(&family, image, &request.user, node, env);

    let registered = client
        .register_task_definition(RegisterTaskDefinitionRequest {
            family: family.clone(),
            network_mode: Some("host".to_string()),
            task_role_arn: Some(task_role(config, &request.user).to_string()),
            execution_role_arn: Some(config.execution_role_arn.clone()),
            container_definitions: vec![definition],
            ..Default::default()
        })
        .await
        .with_context(|| format!("unable to register task definition {}", family))?;
    let task_definition_arn = registered
        .task_definition
        .and_then(|task| task.task_definition_arn)
        .ok_or(Error::MissingLaunchData("a task definition ARN"))?;

    info!("Starting ECS task");
    progress.append("Starting ECS task");
    let started = client
        .start_task(StartTaskRequest {
            cluster: Some(config.ecs_cluster.clone()),
            container_instances: vec![node.container_instance_arn.clone()],
            task_definition: task_definition_arn.clone(),
            ..Default::default()
        })
        .await
        .with_context(|| format!("unable to start {}", task_definition_arn))?;
    let task_arn = started
        .tasks
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|task| task.task_arn)
        .ok_or(Error::MissingLaunchData("a task ARN"))?;

    match wait_until_task_running(&client, &config.ecs_cluster, &task_arn).await {
        Ok(()) => {
            info!("ECS task is running");
            Ok(Some(task_definition_arn))
        }
        Err(err) => {
            error!("Exception while waiting for container to be up : {:#}", err);
            Ok(None)
        }
    }
}

async fn wait_until_task_running(client: &EcsClient, cluster: &str, task_arn: &str) -> Result<()> {
    let policy = RetryPolicy::new(50, Duration::from_secs(1));
    let running = policy
        .run(move || async move {
            let task = client
                .describe_tasks(DescribeTasksRequest {
                    cluster: Some(cluster.to_string()),
                    tasks: vec![task_arn.to_string()],
                    ..Default::default()
                })
                .await
                .context("unable to describe the task")?
                .tasks
                .unwrap_or_default()
                .into_iter()
                .next();

            match task.and_then(|task| task.last_status) {
                Some(status) if status == "RUNNING" => Ok(Some(())),
                Some(status) if status == "STOPPED" => Err(Error::WorkloadStartFailed.into()),
                _ => Ok(None),
            }
        })
        .await?;
    running.ok_or_else(|| Error::ExhaustedAttempts(policy.max_attempts).into())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::config::test_config;

    use super::*;

    fn request(region: &str, instance_type: &str) -> SpawnRequest {
        SpawnRequest {
            user: "bob".to_string(),
            instance_type: instance_type.to_string(),
            region: region.to_string(),
            spot: false,
            volume: None,
            image: None,
        }
    }

    #[test]
    fn family_names_replace_everything_outside_the_safe_set() {
        assert_eq!(task_family("alice.smith"), "jupyter-task-alice_smith");
        assert_eq!(task_family("bob"), "jupyter-task-bob");
        assert_eq!(task_family("weird user@org"), "jupyter-task-weird_user_org");
    }

    #[test]
    fn family_names_are_idempotent() {
        let once = task_family("alice.smith");
        assert_eq!(task_family(&once["jupyter-task-".len()..]), once);
    }

    #[test]
    fn the_allow_list_decides_the_task_role() {
        let config = test_config();
        assert_eq!(task_role(&config, "alice.smith"), config.task_role_arn);
        assert_eq!(task_role(&config, "mallory"), config.default_task_role_arn);
    }

    #[test]
    fn the_image_override_beats_every_default() {
        let config = test_config();
        let catalog = Catalog::load().unwrap();
        let mut request = request("us-east-1", "p3.2xlarge");
        request.image = Some("quay.io/org/notebook:v2".to_string());
        assert_eq!(
            container_image(&config, &catalog, &request).unwrap(),
            "quay.io/org/notebook:v2"
        );
    }

    #[test]
    fn gpu_types_default_to_the_gpu_image() {
        let config = test_config();
        let catalog = Catalog::load().unwrap();
        assert_eq!(
            container_image(&config, &catalog, &request("us-east-1", "p3.2xlarge")).unwrap(),
            config.default_docker_image_gpu
        );
        assert_eq!(
            container_image(&config, &catalog, &request("us-east-1", "t3.medium")).unwrap(),
            config.default_docker_image
        );
    }

    #[test]
    fn the_storage_prefix_always_ends_with_the_user() {
        let mut custom = HashMap::new();
        custom.insert("S3_PREFIX".to_string(), "data".to_string());
        let env = container_environment("bob", &HashMap::new(), &custom);
        assert_eq!(env["S3_PREFIX"], "data/bob");

        let env = container_environment("bob", &HashMap::new(), &HashMap::new());
        assert_eq!(env["S3_PREFIX"], "notebooks/bob");
    }

    #[test]
    fn custom_env_overwrites_computed_keys_except_the_prefix() {
        let mut inherited = HashMap::new();
        inherited.insert("JUPYTERHUB_API_TOKEN".to_string(), "secret".to_string());
        let mut custom = HashMap::new();
        custom.insert("GRANT_SUDO".to_string(), "no".to_string());

        let env = container_environment("alice.smith", &inherited, &custom);
        assert_eq!(env["GRANT_SUDO"], "no");
        assert_eq!(env["NB_USER"], "alice.smith");
        assert_eq!(env["CHOWN_HOME"], "yes");
        assert_eq!(env["JUPYTER_ENABLE_LAB"], "yes");
        assert_eq!(env["JUPYTERHUB_API_TOKEN"], "secret");
        assert_eq!(env["S3_PREFIX"], "notebooks/alice.smith");
    }

    #[test]
    fn the_workload_requests_exactly_the_captured_capacity() {
        let node = NodeRegistration {
            container_instance_arn: "arn:aws:ecs:us-east-1:1:container-instance/abc".to_string(),
            cpu: 2048,
            memory: 4096,
        };
        let definition = container_definition(
            "jupyter-task-bob",
            "jupyter/datascience-notebook:latest".to_string(),
            "bob",
            &node,
            HashMap::new(),
        );

        assert_eq!(definition.cpu, Some(2048));
        assert_eq!(definition.memory, Some(4096));
        assert_eq!(definition.user.as_deref(), Some("root"));
        assert_eq!(definition.working_directory.as_deref(), Some("/home/bob"));
        assert_eq!(
            definition.command,
            Some(vec![
                "start-singleuser.sh".to_string(),
                "--port=8888".to_string(),
                "--SingleUserNotebookApp.default_url=/lab".to_string(),
            ])
        );
    }
}
