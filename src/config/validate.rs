use std::collections::HashSet;

use anyhow::anyhow;

use super::Config;

/// given a Config struct, validate the values to ensure
/// that harvesting and loading won't fail on obviously bad input
pub fn check_config(config: &Config) -> Result<(), anyhow::Error> {
    if config.harvest.host.trim().is_empty() {
        return Err(anyhow!("harvest.host cannot be empty"));
    }

    if config.harvest.port == 0 {
        return Err(anyhow!("harvest.port must be greater than 0"));
    }

    if config.harvest.timeout_secs == 0 {
        return Err(anyhow!("harvest.timeout_secs must be greater than 0"));
    }

    let mut names = HashSet::new();
    for (index, server) in config.servers.iter().enumerate() {
        if server.name.trim().is_empty() {
            return Err(anyhow!("servers{}.name cannot be empty", index));
        }

        if !names.insert(server.name.as_ref()) {
            return Err(anyhow!(
                "servers{}.name '{}' is used by another server",
                index,
                server.name
            ));
        }

        if let Some(path) = &server.keystore {
            if path.as_os_str().is_empty() {
                return Err(anyhow!("servers{}.keystore cannot be empty", index));
            }
        }
    }

    Ok(())
}
