use anyhow::{Context, Result};
use clap::ArgMatches;
use log::info;
use prettytable::{row, Table};
use spawner_lib::{
    catalog::Catalog,
    config::SpawnerConfig,
    ec2,
    session::Session,
    types::SpawnRequest,
};

pub(crate) async fn spawn(sub: &ArgMatches) -> Result<()> {
    let user: String = sub.value_of_t_or_exit("user");
    let instance_type: String = sub.value_of_t_or_exit("instance");
    let region: String = sub.value_of_t_or_exit("region");
    let spot = sub.is_present("spot");
    // absent flag and unparsable value are different things; only the
    // former means "no override"
    let volume = match sub.value_of("volume") {
        Some(raw) => Some(
            raw.parse()
                .with_context(|| format!("{} is not a volume size", raw))?,
        ),
        None => None,
    };
    let image = sub.value_of("image").map(str::to_string);

    let config = SpawnerConfig::load()?;
    let catalog = Catalog::load()?;
    let request = SpawnRequest {
        user,
        instance_type,
        region,
        spot,
        volume,
        image,
    };

    let mut session = Session::new(config, catalog, request);

    let mut cursor = session.progress();
    let reporter = tokio::spawn(async move {
        loop {
            let event = cursor.next().await;
            println!("{}", event.message);
        }
    });

    let started = session.start().await;
    reporter.abort();

    let (ip, port) = started?;
    println!("notebook server up at {}:{}", ip, port);
    Ok(())
}

pub(crate) async fn stop(sub: &ArgMatches) -> Result<()> {
    let region: String = sub.value_of_t_or_exit("region");
    let instance_id: String = sub.value_of_t_or_exit("instance_id");

    info!("Terminating instance {}", instance_id);
    ec2::terminate(&region, &instance_id).await?;
    info!("Instance {} terminated", instance_id);
    Ok(())
}

pub(crate) async fn instances(sub: &ArgMatches) -> Result<()> {
    let region: String = sub.value_of_t_or_exit("region");
    let catalog = Catalog::load()?;

    let mut table = Table::new();
    table.add_row(row!["Type", "Arch", "GPU"]);

    let types = catalog.region_types(&region)?;
    let mut names: Vec<_> = types.keys().collect();
    names.sort();
    for name in names {
        let spec = &types[name];
        table.add_row(row![name, spec.arch, spec.gpu]);
    }

    table.printstd();
    Ok(())
}

pub(crate) async fn regions() -> Result<()> {
    let catalog = Catalog::load()?;
    for region in catalog.regions() {
        println!("{}", region);
    }
    Ok(())
}
