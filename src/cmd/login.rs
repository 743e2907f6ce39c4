use super::tenant::Registration;
use crate::config::{AuthType, ConfigManager};
use crate::error::{IntunePackError, Result};
use crate::graph::auth::GraphAuth;
use clap::Args;
use colored::Colorize;

/// First `n` characters, safe on non-ASCII input
fn truncate_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Name of a configured tenant
    #[arg(index = 1)]
    name: Option<String>,

    /// Tenant name, alias for the positional argument
    #[arg(short, long)]
    tenant: Option<String>,

    // first-time setup: saves the tenant before signing in
    #[command(flatten)]
    registration: Registration,
}

#[derive(Args, Debug)]
pub struct LogoutArgs {
    #[arg(short, long)]
    tenant: Option<String>,

    /// Log out of every configured tenant
    #[arg(long)]
    all: bool,
}

const LOGIN_USAGE: &str = "Usage:\n  \
    intunepack login CONTOSO                                # configured tenant\n  \
    intunepack login CONTOSO --tenant-id ID --client-id ID  # first-time setup";

pub async fn login(args: LoginArgs) -> Result<()> {
    let config_manager = ConfigManager::new()?;
    let auth = GraphAuth::new(config_manager.clone());

    let name = args.name.or(args.tenant);
    let existing = match &name {
        Some(name) if args.registration.is_empty() => Some(config_manager.get_tenant(name)?),
        None if args.registration.is_empty() => {
            return Err(IntunePackError::InvalidConfig(LOGIN_USAGE.into()));
        }
        _ => None,
    };

    let tenant = match existing {
        Some(tenant) => {
            println!(
                "{} Tenant: {} ({})",
                "→".cyan(),
                tenant.name.bold(),
                tenant.description.as_deref().unwrap_or("no description")
            );
            println!("  Tenant ID: {}...", truncate_chars(&tenant.tenant_id, 8));
            println!("  Client ID: {}...", truncate_chars(&tenant.client_id, 8));
            tenant
        }
        None => args.registration.save(&config_manager, name)?,
    };

    match tenant.auth_type {
        AuthType::DeviceCode => auth.login_device_code(&tenant).await?,
        AuthType::ClientCredentials => auth.login_client_credentials(&tenant).await?,
    };

    config_manager.set_active_tenant(&tenant.name)?;
    println!("\n{} Active tenant: {}", "→".cyan(), tenant.name.bold());
    Ok(())
}

pub async fn logout(args: LogoutArgs) -> Result<()> {
    let config_manager = ConfigManager::new()?;
    let auth = GraphAuth::new(config_manager.clone());

    if args.all {
        for tenant in config_manager.load_tenants()? {
            auth.logout(&tenant.name)?;
        }
        println!("{} Logged out from all tenants", "✓".green());
    } else if let Some(tenant_name) = &args.tenant {
        auth.logout(tenant_name)?;
    } else {
        match config_manager.load_config()?.current_tenant {
            Some(current) => auth.logout(&current)?,
            None => println!("{} No active tenant", "!".yellow()),
        }
    }

    Ok(())
}
