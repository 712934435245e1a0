use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use rusoto_core::Region;
use rusoto_ec2::{
    BlockDeviceMapping, CreateTagsRequest, DescribeImagesRequest, DescribeInstancesRequest,
    DescribeSpotInstanceRequestsRequest, EbsBlockDevice, Ec2, Ec2Client,
    IamInstanceProfileSpecification, Instance, InstanceNetworkInterfaceSpecification,
    RequestSpotInstancesRequest, RequestSpotLaunchSpecification, RunInstancesRequest, Tag,
    TagSpecification, TerminateInstancesRequest,
};

use crate::catalog::Catalog;
use crate::config::SpawnerConfig;
use crate::error::Error;
use crate::progress::ProgressLog;
use crate::retry::RetryPolicy;
use crate::types::{Ec2Instance, SpawnRequest};

// Lifecycle transitions (pending->running, spot fulfillment, shutting
// down->terminated) usually land within a few minutes.
fn state_wait() -> RetryPolicy {
    RetryPolicy::new(120, Duration::from_secs(5))
}

pub(crate) fn ec2_client(region: &str) -> Result<Ec2Client> {
    let region = Region::from_str(region).with_context(|| format!("Region {} not found", region))?;
    Ok(Ec2Client::new(region))
}

/// Boot script that joins the machine to the target cluster once the
/// ECS agent comes up.
fn user_data(cluster: &str) -> String {
    base64::encode(format!(
        "#!/bin/bash\necho ECS_CLUSTER={} >> /etc/ecs/ecs.config\n",
        cluster
    ))
}

pub fn name_tag(user: &str) -> String {
    format!("jupyter-notebook-{}", user)
}

fn instance_tags(config: &SpawnerConfig, user: &str) -> Vec<Tag> {
    let mut tags = vec![Tag {
        key: Some("Name".to_string()),
        value: Some(name_tag(user)),
    }];
    for (key, value) in &config.custom_tags {
        tags.push(Tag {
            key: Some(key.clone()),
            value: Some(value.clone()),
        });
    }
    tags
}

fn network_interface(config: &SpawnerConfig) -> InstanceNetworkInterfaceSpecification {
    InstanceNetworkInterfaceSpecification {
        device_index: Some(0),
        subnet_id: Some(config.subnet_id.clone()),
        groups: Some(config.security_group_ids.clone()),
        associate_public_ip_address: Some(config.use_public_ip),
        ..Default::default()
    }
}

/// The requested root-volume override, with the device name looked up
/// from the AMI's block-device mapping. `None` when the user kept the
/// image default.
async fn root_volume_override(
    client: &Ec2Client,
    ami: &str,
    volume: Option<i64>,
) -> Result<Option<Vec<BlockDeviceMapping>>> {
    let volume_size = match volume {
        Some(volume_size) => volume_size,
        None => return Ok(None),
    };

    let response = client
        .describe_images(DescribeImagesRequest {
            image_ids: Some(vec![ami.to_string()]),
            ..Default::default()
        })
        .await
        .with_context(|| format!("unable to describe image {}", ami))?;
    let device_name = response
        .images
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|image| image.block_device_mappings)
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|mapping| mapping.device_name)
        .ok_or(Error::MissingLaunchData("a root device name"))?;

    Ok(Some(vec![BlockDeviceMapping {
        device_name: Some(device_name),
        ebs: Some(EbsBlockDevice {
            volume_size: Some(volume_size),
            volume_type: Some("gp2".to_string()),
            delete_on_termination: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }]))
}

/// Launches the session's machine, on-demand or spot depending solely on
/// the request, and resolves its address once it is running. Nothing in
/// here is retried beyond the bounded state waits; a failed launch is
/// fatal to the session.
pub async fn launch(
    config: &SpawnerConfig,
    catalog: &Catalog,
    request: &SpawnRequest,
    progress: &ProgressLog,
) -> Result<Ec2Instance> {
    let ami = catalog.select_ami(config, &request.region, &request.instance_type)?;
    info!("Using AMI {}", ami);

    let client = ec2_client(&request.region)?;
    let instance_id = if request.spot {
        progress.append(format!("Requesting {} spot instance", request.instance_type));
        request_spot_instance(&client, config, request, &ami, progress).await?
    } else {
        progress.append(format!(
            "Requesting {} non spot instance",
            request.instance_type
        ));
        run_instance(&client, config, request, &ami).await?
    };

    let instance = wait_until_running(&client, &instance_id).await?;
    let ip = resolve_ip(&instance, config.use_public_ip)?;
    progress.append("Instance running");
    info!("EC2 instance is running (id: {})", instance_id);

    Ok(Ec2Instance {
        id: instance_id,
        ip,
    })
}

async fn run_instance(
    client: &Ec2Client,
    config: &SpawnerConfig,
    request: &SpawnRequest,
    ami: &str,
) -> Result<String> {
    info!(
        "Requesting non spot instance of type {}",
        request.instance_type
    );
    let run_args = RunInstancesRequest {
        image_id: Some(ami.to_string()),
        min_count: 1,
        max_count: 1,
        instance_type: Some(request.instance_type.clone()),
        user_data: Some(user_data(&config.ecs_cluster)),
        instance_initiated_shutdown_behavior: Some("terminate".to_string()),
        iam_instance_profile: Some(IamInstanceProfileSpecification {
            arn: Some(config.instance_role_arn.clone()),
            ..Default::default()
        }),
        tag_specifications: Some(vec![TagSpecification {
            resource_type: Some("instance".to_string()),
            tags: Some(instance_tags(config, &request.user)),
        }]),
        key_name: config.key_pair_name.clone(),
        network_interfaces: Some(vec![network_interface(config)]),
        block_device_mappings: root_volume_override(client, ami, request.volume).await?,
        ..Default::default()
    };

    let reservation = client
        .run_instances(run_args)
        .await
        .context("unable to launch the instance")?;
    reservation
        .instances
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|instance| instance.instance_id)
        .ok_or_else(|| Error::MissingLaunchData("an instance id").into())
}

async fn request_spot_instance(
    client: &Ec2Client,
    config: &SpawnerConfig,
    request: &SpawnRequest,
    ami: &str,
    progress: &ProgressLog,
) -> Result<String> {
    info!("Requesting spot instance");
    let launch_specification = RequestSpotLaunchSpecification {
        image_id: Some(ami.to_string()),
        instance_type: Some(request.instance_type.clone()),
        user_data: Some(user_data(&config.ecs_cluster)),
        iam_instance_profile: Some(IamInstanceProfileSpecification {
            arn: Some(config.instance_role_arn.clone()),
            ..Default::default()
        }),
        key_name: config.key_pair_name.clone(),
        network_interfaces: Some(vec![network_interface(config)]),
        block_device_mappings: root_volume_override(client, ami, request.volume).await?,
        ..Default::default()
    };

    let response = client
        .request_spot_instances(RequestSpotInstancesRequest {
            instance_count: Some(1),
            launch_specification: Some(launch_specification),
            ..Default::default()
        })
        .await
        .context("unable to create the spot request")?;
    let request_id = response
        .spot_instance_requests
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|spot| spot.spot_instance_request_id)
        .ok_or(Error::MissingLaunchData("a spot request id"))?;
    progress.append("Spot request created");

    let instance_id = wait_until_fulfilled(client, &request_id).await?;
    progress.append("Spot instance running");

    client
        .create_tags(CreateTagsRequest {
            resources: vec![instance_id.clone()],
            tags: instance_tags(config, &request.user),
            ..Default::default()
        })
        .await
        .with_context(|| format!("unable to tag spot instance {}", instance_id))?;

    Ok(instance_id)
}

async fn wait_until_fulfilled(client: &Ec2Client, request_id: &str) -> Result<String> {
    let policy = state_wait();
    let fulfilled = policy
        .run(move || async move {
            let response = client
                .describe_spot_instance_requests(DescribeSpotInstanceRequestsRequest {
                    spot_instance_request_ids: Some(vec![request_id.to_string()]),
                    ..Default::default()
                })
                .await
                .context("unable to describe the spot request")?;
            Ok(response
                .spot_instance_requests
                .unwrap_or_default()
                .into_iter()
                .next()
                .and_then(|spot| spot.instance_id))
        })
        .await?;
    fulfilled.ok_or_else(|| Error::ExhaustedAttempts(policy.max_attempts).into())
}

async fn describe_instance(client: &Ec2Client, instance_id: &str) -> Result<Option<Instance>> {
    let request = DescribeInstancesRequest {
        instance_ids: Some(vec![instance_id.to_string()]),
        dry_run: None,
        filters: None,
        max_results: None,
        next_token: None,
    };

    let response = client
        .describe_instances(request)
        .await
        .context("unable to fetch EC2 instance info")?;

    Ok(response
        .reservations
        .unwrap_or_default()
        .into_iter()
        .flat_map(|reservation| reservation.instances.unwrap_or_default())
        .next())
}

async fn wait_until_running(client: &Ec2Client, instance_id: &str) -> Result<Instance> {
    wait_for_state(client, instance_id, "running").await
}

async fn wait_for_state(client: &Ec2Client, instance_id: &str, state: &str) -> Result<Instance> {
    let policy = state_wait();
    let instance = policy
        .run(move || async move {
            let instance = describe_instance(client, instance_id).await?;
            Ok(instance.filter(|instance| {
                instance
                    .state
                    .as_ref()
                    .and_then(|s| s.name.as_deref())
                    .map_or(false, |name| name == state)
            }))
        })
        .await?;
    instance.ok_or_else(|| Error::ExhaustedAttempts(policy.max_attempts).into())
}

fn resolve_ip(instance: &Instance, use_public_ip: bool) -> Result<String> {
    let ip = if use_public_ip {
        instance
            .public_ip_address
            .clone()
            .ok_or(Error::MissingLaunchData("a public IP address"))?
    } else {
        instance
            .private_ip_address
            .clone()
            .ok_or(Error::MissingLaunchData("a private IP address"))?
    };
    Ok(ip)
}

/// Terminates the session's machine and blocks until the cloud confirms
/// it. A termination failure surfaces to the host; there is nothing
/// sensible to do with it here.
pub async fn terminate(region: &str, instance_id: &str) -> Result<()> {
    let client = ec2_client(region)?;
    client
        .terminate_instances(TerminateInstancesRequest {
            instance_ids: vec![instance_id.to_string()],
            ..Default::default()
        })
        .await
        .with_context(|| format!("unable to terminate instance {}", instance_id))?;

    wait_for_state(&client, instance_id, "terminated").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::config::test_config;

    use super::*;

    #[test]
    fn user_data_registers_the_cluster() {
        let decoded = base64::decode(user_data("jupyter")).unwrap();
        let script = String::from_utf8(decoded).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("ECS_CLUSTER=jupyter >> /etc/ecs/ecs.config"));
    }

    #[test]
    fn the_name_tag_derives_from_the_user() {
        let mut config = test_config();
        config
            .custom_tags
            .insert("team".to_string(), "data".to_string());

        let tags = instance_tags(&config, "alice.smith");
        assert_eq!(tags[0].key.as_deref(), Some("Name"));
        assert_eq!(tags[0].value.as_deref(), Some("jupyter-notebook-alice.smith"));
        assert!(tags
            .iter()
            .any(|tag| tag.key.as_deref() == Some("team") && tag.value.as_deref() == Some("data")));
    }

    #[test]
    fn the_network_interface_follows_the_config() {
        let mut config = test_config();
        config.use_public_ip = true;
        let nic = network_interface(&config);
        assert_eq!(nic.device_index, Some(0));
        assert_eq!(nic.subnet_id.as_deref(), Some("subnet-0123456789abcdef0"));
        assert_eq!(nic.associate_public_ip_address, Some(true));
    }

    #[test]
    fn resolve_ip_honors_the_public_ip_setting() {
        let instance = Instance {
            public_ip_address: Some("203.0.113.7".to_string()),
            private_ip_address: Some("10.0.0.7".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_ip(&instance, true).unwrap(), "203.0.113.7");
        assert_eq!(resolve_ip(&instance, false).unwrap(), "10.0.0.7");

        let bare = Instance::default();
        assert!(resolve_ip(&bare, true).is_err());
    }
}
