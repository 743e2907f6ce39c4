//! `tenant add|list|switch|remove`

use crate::config::{AuthType, ConfigManager, TenantConfig, TokenCache};
use crate::error::{IntunePackError, Result};
use clap::Args;
use colored::{ColoredString, Colorize};

/// App registration flags shared by `tenant add` and first-time `login`
#[derive(Args, Debug, Clone, Default)]
pub struct Registration {
    /// Entra ID tenant ID
    #[arg(long)]
    pub tenant_id: Option<String>,

    /// App registration client ID
    #[arg(long)]
    pub client_id: Option<String>,

    /// Client secret (implies client credentials flow)
    #[arg(long)]
    pub client_secret: Option<String>,

    /// Use client credentials flow instead of device code
    #[arg(long)]
    pub client_credentials: bool,

    #[arg(long)]
    pub description: Option<String>,
}

impl Registration {
    pub fn is_empty(&self) -> bool {
        self.tenant_id.is_none() && self.client_id.is_none()
    }

    /// Save as tenant `name`, or as the first block of the tenant ID
    pub fn save(self, config_manager: &ConfigManager, name: Option<String>) -> Result<TenantConfig> {
        let (Some(tenant_id), Some(client_id)) = (self.tenant_id, self.client_id) else {
            return Err(IntunePackError::InvalidConfig(
                "Both --tenant-id and --client-id are required to register a tenant".into(),
            ));
        };

        let name = name.unwrap_or_else(|| {
            let auto_name = tenant_id.split('-').next().unwrap_or("tenant").to_string();
            println!("{} No name given, saving tenant as {}", "→".cyan(), auto_name.bold());
            auto_name
        });
        let auth_type = if self.client_credentials || self.client_secret.is_some() {
            AuthType::ClientCredentials
        } else {
            AuthType::DeviceCode
        };

        let tenant = TenantConfig {
            name,
            tenant_id,
            client_id,
            client_secret: self.client_secret,
            auth_type,
            description: self.description,
        };
        config_manager.add_tenant(tenant.clone())?;
        println!("{} Tenant '{}' saved", "✓".green(), tenant.name);
        Ok(tenant)
    }
}

#[derive(Args, Debug)]
pub struct TenantAddArgs {
    name: String,

    #[command(flatten)]
    registration: Registration,
}

#[derive(Args, Debug)]
pub struct TenantListArgs {
    /// Show IDs and token status
    #[arg(short, long)]
    details: bool,
}

#[derive(Args, Debug)]
pub struct TenantSwitchArgs {
    name: String,
}

#[derive(Args, Debug)]
pub struct TenantRemoveArgs {
    name: String,
}

fn token_status(token: Option<&TokenCache>) -> ColoredString {
    match token {
        None => "not signed in".yellow(),
        Some(t) if !t.expires_within(chrono::Duration::zero()) => {
            format!("valid until {}", t.expires_at.format("%Y-%m-%d %H:%M UTC")).green()
        }
        Some(t) if t.refresh_token.is_some() => "expired, refreshes on next use".yellow(),
        Some(_) => "expired".red(),
    }
}

pub async fn add(args: TenantAddArgs) -> Result<()> {
    let tenant = args
        .registration
        .save(&ConfigManager::new()?, Some(args.name))?;
    println!("  Run {} to authenticate", format!("intunepack login {}", tenant.name).bold());
    Ok(())
}

pub async fn list(args: TenantListArgs) -> Result<()> {
    let config_manager = ConfigManager::new()?;
    let tenants = config_manager.load_tenants()?;
    if tenants.is_empty() {
        println!("{} No tenants; add one with {}", "!".yellow(), "intunepack tenant add".bold());
        return Ok(());
    }

    let active = config_manager.load_config()?.current_tenant;
    for tenant in &tenants {
        let is_active = active.as_deref() == Some(tenant.name.as_str());
        let token = config_manager.load_cached_token(&tenant.name)?;
        println!(
            "{} {:<16} {}",
            if is_active { "●".green() } else { "○".dimmed() },
            tenant.name.bold(),
            token_status(token.as_ref())
        );

        if args.details {
            println!("    tenant {}  client {}", tenant.tenant_id, tenant.client_id);
            println!(
                "    {:?}{}",
                tenant.auth_type,
                tenant
                    .description
                    .as_deref()
                    .map(|d| format!(" - {}", d))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

pub async fn switch(args: TenantSwitchArgs) -> Result<()> {
    ConfigManager::new()?.set_active_tenant(&args.name)?;
    println!("{} Switched to tenant '{}'", "✓".green(), args.name);
    Ok(())
}

pub async fn remove(args: TenantRemoveArgs) -> Result<()> {
    ConfigManager::new()?.remove_tenant(&args.name)?;
    println!("{} Tenant '{}' removed", "✓".green(), args.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_requires_both_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        let registration = Registration {
            tenant_id: Some("abcd1234-0000".into()),
            ..Default::default()
        };
        assert!(!registration.is_empty());
        assert!(matches!(
            registration.save(&manager, Some("CONTOSO".into())),
            Err(IntunePackError::InvalidConfig(_))
        ));
        assert!(Registration::default().is_empty());
    }

    #[test]
    fn test_registration_with_secret_uses_client_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        let registration = Registration {
            tenant_id: Some("abcd1234-0000-0000-0000-000000000000".into()),
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            ..Default::default()
        };

        let tenant = registration.save(&manager, None).unwrap();
        assert_eq!(tenant.name, "abcd1234");
        assert_eq!(tenant.auth_type, AuthType::ClientCredentials);
        assert_eq!(manager.get_tenant("abcd1234").unwrap().client_id, "client");
    }

    #[test]
    fn test_token_status() {
        let token = |minutes: i64, refresh: bool| TokenCache {
            access_token: "a".into(),
            refresh_token: refresh.then(|| "r".into()),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(minutes),
            tenant_id: "t".into(),
        };
        assert!(token_status(None).contains("not signed in"));
        assert!(token_status(Some(&token(30, false))).contains("valid until"));
        assert!(token_status(Some(&token(-5, true))).contains("refreshes"));
        assert_eq!(&*token_status(Some(&token(-5, false))), "expired");
    }
}
