mod cli;

use anyhow::{bail, Result};
use clap::clap_app;

#[tokio::main]
async fn main() -> Result<()> {
    let mut app = clap_app!(spawner =>
      (version: "0.1.0")
      (about: "Spawn notebook servers on ECS!")
      (@subcommand spawn =>
        (about: "Provision an instance and start the notebook task on it")
        (@arg user: +takes_value +required "user the session belongs to")
        (@arg instance: +takes_value +required "EC2 instance type")
        (@arg region: +takes_value +required "AWS region")
        (@arg spot: --spot "request a spot instance instead of on-demand")
        (@arg volume: --volume +takes_value "root volume size override in GiB")
        (@arg image: --image +takes_value "docker image override"))
      (@subcommand stop =>
        (about: "Terminate a session's instance and wait for confirmation")
        (@arg region: +takes_value +required "AWS region")
        (@arg instance_id: +takes_value +required "EC2 instance id"))
      (@subcommand instances =>
        (about: "Show the instance types selectable in a region")
        (@arg region: +takes_value +required "AWS region"))
      (@subcommand regions =>
        (about: "Show the selectable regions"))
    );

    let mut help_text = Vec::new();
    app.write_help(&mut help_text)
        .expect("Failed to write help text to buffer");
    let matches = app.get_matches();

    match matches.subcommand() {
        Some(("spawn", sub)) => {
            pretty_env_logger::init();
            cli::spawn(sub).await
        }
        Some(("stop", sub)) => {
            pretty_env_logger::init();
            cli::stop(sub).await
        }
        Some(("instances", sub)) => cli::instances(sub).await,
        Some(("regions", _sub)) => cli::regions().await,
        _ => {
            bail!(format!(
                "Invalid subcommand\n {}",
                String::from_utf8(help_text).expect("help text contains invalid UTF8")
            ))
        }
    }?;
    Ok(())
}
