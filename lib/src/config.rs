use std::collections::HashMap;
use std::env;
use std::fs::read_to_string;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Operator-side deployment settings. Loaded once from the JSON file named
/// by `SPAWNER_CONFIG` and shared by every session.
#[derive(Clone, Debug, Deserialize)]
pub struct SpawnerConfig {
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    #[serde(default = "default_cluster")]
    pub ecs_cluster: String,
    pub instance_role_arn: String,
    pub execution_role_arn: String,
    /// Role granted to users on the allow-list below.
    pub task_role_arn: String,
    /// Role granted to everyone else.
    pub default_task_role_arn: String,
    #[serde(default)]
    pub task_role_users: Vec<String>,
    pub default_docker_image: String,
    pub default_docker_image_gpu: String,
    /// Per-deployment AMI overrides; when unset the per-region defaults
    /// from the embedded catalog apply.
    #[serde(default)]
    pub ec2_ami: Option<String>,
    #[serde(default)]
    pub ec2_arm_ami: Option<String>,
    #[serde(default)]
    pub ec2_gpu_ami: Option<String>,
    #[serde(default)]
    pub key_pair_name: Option<String>,
    #[serde(default)]
    pub use_public_ip: bool,
    #[serde(default)]
    pub custom_env: HashMap<String, String>,
    #[serde(default)]
    pub custom_tags: HashMap<String, String>,
}

fn default_cluster() -> String {
    "default".to_string()
}

impl SpawnerConfig {
    pub fn load() -> Result<Self> {
        let path = env::var("SPAWNER_CONFIG")
            .context("SPAWNER_CONFIG environment variable must be set")?;
        let raw = read_to_string(&path).with_context(|| format!("unable to read {}", path))?;
        let config = serde_json::from_str(&raw).with_context(|| format!("unable to parse {}", path))?;
        Ok(config)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> SpawnerConfig {
    let mut custom_env = HashMap::new();
    custom_env.insert("AWS_DEFAULT_REGION".to_string(), "us-east-1".to_string());
    SpawnerConfig {
        subnet_id: "subnet-0123456789abcdef0".to_string(),
        security_group_ids: vec!["sg-0123456789abcdef0".to_string()],
        ecs_cluster: "jupyter".to_string(),
        instance_role_arn: "arn:aws:iam::123456789012:instance-profile/ecsInstanceRole".to_string(),
        execution_role_arn: "arn:aws:iam::123456789012:role/ecsTaskExecutionRole".to_string(),
        task_role_arn: "arn:aws:iam::123456789012:role/PowerUserTaskRole".to_string(),
        default_task_role_arn: "arn:aws:iam::123456789012:role/DataAnalystRole".to_string(),
        task_role_users: vec!["alice.smith".to_string(), "bob".to_string()],
        default_docker_image: "jupyter/datascience-notebook:latest".to_string(),
        default_docker_image_gpu: "cschranz/gpu-jupyter:latest".to_string(),
        ec2_ami: None,
        ec2_arm_ami: None,
        ec2_gpu_ami: None,
        key_pair_name: None,
        use_public_ip: false,
        custom_env,
        custom_tags: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let config: SpawnerConfig = serde_json::from_str(
            r#"{
                "subnet_id": "subnet-1",
                "security_group_ids": ["sg-1", "sg-2"],
                "instance_role_arn": "arn:aws:iam::1:instance-profile/i",
                "execution_role_arn": "arn:aws:iam::1:role/e",
                "task_role_arn": "arn:aws:iam::1:role/t",
                "default_task_role_arn": "arn:aws:iam::1:role/d",
                "default_docker_image": "jupyter/base-notebook",
                "default_docker_image_gpu": "cschranz/gpu-jupyter"
            }"#,
        )
        .unwrap();

        assert_eq!(config.ecs_cluster, "default");
        assert_eq!(config.use_public_ip, false);
        assert!(config.key_pair_name.is_none());
        assert!(config.task_role_users.is_empty());
        assert!(config.custom_env.is_empty());
    }

    #[test]
    fn load_requires_the_env_var() {
        std::env::remove_var("SPAWNER_CONFIG");
        let err = SpawnerConfig::load().unwrap_err();
        assert!(err.to_string().contains("SPAWNER_CONFIG"));
    }
}
