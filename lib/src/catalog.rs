use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::SpawnerConfig;
use crate::error::Error;

/// Architecture and accelerator facts for one instance type in one region.
#[derive(Clone, Debug, Deserialize)]
pub struct InstanceSpec {
    pub arch: String,
    #[serde(default)]
    pub gpu: bool,
}

/// Default ECS-optimized AMIs of one region, one per flavour.
#[derive(Clone, Debug, Deserialize)]
pub struct AmiSet {
    pub amd: String,
    pub arm64: String,
    pub gpu: String,
}

/// The static per-region tables shipped with the crate: which instance
/// types are selectable where, and which AMI boots them by default.
#[derive(Clone, Debug)]
pub struct Catalog {
    instances: HashMap<String, HashMap<String, InstanceSpec>>,
    amis: HashMap<String, AmiSet>,
    regions: Vec<String>,
}

impl Catalog {
    pub fn load() -> Result<Self> {
        let instances = serde_json::from_str(include_str!("../data/instances.json"))
            .context("embedded instances.json is invalid")?;
        let amis = serde_json::from_str(include_str!("../data/amis.json"))
            .context("embedded amis.json is invalid")?;
        let regions = serde_json::from_str(include_str!("../data/regions.json"))
            .context("embedded regions.json is invalid")?;
        Ok(Catalog {
            instances,
            amis,
            regions,
        })
    }

    /// Regions offered on the selection form.
    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    /// All instance types selectable in `region`, for the selection form.
    pub fn region_types(&self, region: &str) -> Result<&HashMap<String, InstanceSpec>> {
        self.instances
            .get(region)
            .ok_or_else(|| Error::NoSuchRegion(region.to_string()).into())
    }

    pub fn instance(&self, region: &str, instance_type: &str) -> Result<&InstanceSpec> {
        self.instances
            .get(region)
            .and_then(|types| types.get(instance_type))
            .ok_or_else(|| {
                Error::UnknownInstanceType {
                    region: region.to_string(),
                    instance_type: instance_type.to_string(),
                }
                .into()
            })
    }

    fn amis(&self, region: &str) -> Result<&AmiSet> {
        self.amis
            .get(region)
            .ok_or_else(|| Error::NoSuchRegion(region.to_string()).into())
    }

    /// Picks the boot image for a (region, type) pair. GPU types boot the
    /// accelerator image, x86_64/i386 the standard one, everything else
    /// the alternate-architecture one; a per-deployment override beats the
    /// region default in each branch.
    pub fn select_ami(
        &self,
        config: &SpawnerConfig,
        region: &str,
        instance_type: &str,
    ) -> Result<String> {
        let spec = self.instance(region, instance_type)?;
        let defaults = self.amis(region)?;

        let ami = if spec.gpu {
            config.ec2_gpu_ami.clone().unwrap_or_else(|| defaults.gpu.clone())
        } else if spec.arch == "x86_64" || spec.arch == "i386" {
            config.ec2_ami.clone().unwrap_or_else(|| defaults.amd.clone())
        } else {
            config
                .ec2_arm_ami
                .clone()
                .unwrap_or_else(|| defaults.arm64.clone())
        };
        Ok(ami)
    }
}
