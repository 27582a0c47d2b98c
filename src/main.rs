use std::{fs, path::Path};

use anyhow::{anyhow, bail, Context};
use clap::crate_version;
use itertools::Itertools;
use pushkeys::{
    config::{load, Command, Config, LogFormat},
    harvest::CertificateHarvester,
    keystore::{self, KeystoreTarget},
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[deny(
    clippy::all,
    clippy::pedantic,
    clippy::perf,
    clippy::correctness,
    clippy::style,
    clippy::suspicious,
    clippy::complexity
)]
fn main() -> Result<(), anyhow::Error> {
    // Loads configuration from command-line, YAML or environment sources
    let config = load("/etc/pushkeys")?;

    setup_logging(&config);

    tracing::info!(
        version = crate_version!(),
        servers = config.servers.len(),
        "pushkeys starting"
    );

    match &config.command {
        Some(Command::Harvest { out }) => harvest(&config, out.as_deref()),
        Some(Command::Load { server }) => load_servers(&config, server.as_deref()),
        Some(Command::Check) | None => check_servers(&config),
    }
}

fn setup_logging(config: &Config) {
    // RUST_LOG directives take precedence over the configured level
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(&config.logging.level).into())
        .from_env_lossy();

    if config.logging.format == LogFormat::Json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().compact().with_env_filter(filter).init();
    }
}

fn harvest(config: &Config, out: Option<&Path>) -> Result<(), anyhow::Error> {
    let harvester = CertificateHarvester::new(config.harvest.endpoint());
    let keystore = harvester.harvest()?;

    let alias = harvester.endpoint().alias(0);
    let certificate = keystore
        .certificate(&alias)
        .ok_or_else(|| anyhow!("harvested keystore has no entry named {alias}"))?;

    tracing::info!(alias = %alias, endpoint = %harvester.endpoint(), "certificate harvested");

    if let Some(path) = out {
        let pem = certificate.to_pem()?;
        fs::write(path, pem)
            .with_context(|| format!("failed to write certificate to {}", path.display()))?;
        tracing::info!(path = %path.display(), "certificate written");
    }

    Ok(())
}

fn load_servers(config: &Config, only: Option<&str>) -> Result<(), anyhow::Error> {
    let servers = config
        .servers
        .iter()
        .filter(|server| only.map_or(true, |name| server.name == name))
        .collect::<Vec<_>>();

    if servers.is_empty() {
        match only {
            Some(name) => bail!("no server configured with name {name}"),
            None => bail!("no server configured"),
        }
    }

    let mut failures = 0;
    for server in servers {
        match keystore::load_for(server) {
            Ok(loaded) => tracing::info!(
                server = %server.identity(),
                keystore_type = %loaded.keystore_type(),
                aliases = %loaded.aliases().join(", "),
                "keystore loaded"
            ),
            Err(err) => {
                failures += 1;
                tracing::error!(server = %server.identity(), error = %err, "keystore failed to load");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} keystore(s) failed to load");
    }

    Ok(())
}

fn check_servers(config: &Config) -> Result<(), anyhow::Error> {
    let mut failures = 0;
    for server in &config.servers {
        match keystore::validate_keystore(server.keystore_reference().as_ref()) {
            Ok(()) => tracing::info!(server = %server.identity(), "keystore reference is valid"),
            Err(err) => {
                failures += 1;
                tracing::error!(server = %server.identity(), error = %err, "invalid keystore reference");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} keystore reference(s) are invalid");
    }

    Ok(())
}
