//! Provisions a dedicated EC2 instance plus a single-user notebook task
//! on ECS for each user session, and tears both down again.
//!
//! The pipeline per session: pick an AMI from the embedded catalog,
//! launch the machine (on-demand or spot), wait for it to register with
//! the cluster, then register and start the notebook task sized to the
//! node's capacity. [`session::Session`] sequences the stages and owns
//! the progress log the host UI streams from.

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod ec2;
pub mod error;
pub mod progress;
pub mod retry;
pub mod session;
pub mod task;
pub mod types;

pub use anyhow::Result;
