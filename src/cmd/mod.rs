pub mod app;
pub mod login;
pub mod package;
pub mod progress;
pub mod tenant;
pub mod wdac;

use crate::config::{Config, ConfigManager, TenantConfig};
use crate::error::{IntunePackError, Result};
use crate::graph::GraphClient;
use colored::Colorize;
use dialoguer::{Confirm, theme::ColorfulTheme};

/// Loaded configuration plus a Graph client for the active tenant
pub struct Session {
    pub config: Config,
    pub tenant: TenantConfig,
    pub graph: GraphClient,
}

pub async fn connect() -> Result<Session> {
    let config_manager = ConfigManager::load()?;
    let config = config_manager.load_config()?;
    let tenant = config_manager.get_active_tenant()?.ok_or_else(|| {
        IntunePackError::ConfigError(
            "No active tenant. Run 'intunepack login <tenant>' first".into(),
        )
    })?;

    println!("{} Active tenant: {}", "→".cyan(), tenant.name.cyan().bold());
    let graph = GraphClient::from_config(&config_manager, &tenant).await?;

    Ok(Session {
        config,
        tenant,
        graph,
    })
}

/// Configuration only, for commands that never talk to Graph
pub fn local_config() -> Result<Config> {
    ConfigManager::load()?.load_config()
}

/// Yes/no prompt; `assume_yes` skips it
pub fn confirm(message: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(message)
        .default(false)
        .interact()?)
}
