use crate::error::{IntunePackError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub default_tenant: Option<String>,

    #[serde(default)]
    pub log_level: String,

    #[serde(default)]
    pub current_tenant: Option<String>,

    #[serde(default)]
    pub packaging: PackagingSettings,
}

/// Defaults for packaging and upload, overridable per command
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PackagingSettings {
    /// PSADT template folder used by `package build`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,

    pub output_dir: PathBuf,

    /// IntuneWinAppUtil.exe; the native packager is used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intunewin_tool: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub makecat_path: Option<PathBuf>,

    pub group_prefix: String,

    pub chunk_size_mb: usize,

    pub max_chunk_retries: u32,
}

impl Default for PackagingSettings {
    fn default() -> Self {
        Self {
            template_dir: None,
            output_dir: PathBuf::from("./output"),
            intunewin_tool: None,
            makecat_path: None,
            group_prefix: "APP".to_string(),
            chunk_size_mb: 6,
            max_chunk_retries: 5,
        }
    }
}

impl PackagingSettings {
    /// Azure block size in bytes
    pub fn chunk_size_bytes(&self) -> Result<usize> {
        // Azure Storage caps a single block at 4000 MiB.
        if self.chunk_size_mb == 0 || self.chunk_size_mb > 4000 {
            return Err(IntunePackError::InvalidConfig(format!(
                "chunk_size_mb must be between 1 and 4000 (got {})",
                self.chunk_size_mb
            )));
        }
        Ok(self.chunk_size_mb * 1024 * 1024)
    }
}

/// Tenant-specific configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TenantConfig {
    pub name: String,
    pub tenant_id: String,
    pub client_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub auth_type: AuthType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    DeviceCode,
    ClientCredentials,
}

/// Token cache structure
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenCache {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub tenant_id: String,
}

impl TokenCache {
    pub fn expires_within(&self, margin: chrono::Duration) -> bool {
        self.expires_at <= chrono::Utc::now() + margin
    }
}

/// Configuration manager
#[derive(Clone)]
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "intunepack", "intunepack").ok_or_else(|| {
            IntunePackError::ConfigError("Failed to determine config directory".into())
        })?;

        Self::with_dir(project_dirs.config_dir())
    }

    /// Use an explicit configuration directory
    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let config_dir = dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
        }

        Ok(Self { config_dir })
    }

    pub fn load() -> Result<Self> {
        Self::new()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn tenants_file(&self) -> PathBuf {
        self.config_dir.join("tenants.toml")
    }

    pub fn token_cache_file(&self, tenant_name: &str) -> PathBuf {
        self.config_dir
            .join("cache")
            .join(format!("{}.token", tenant_name))
    }

    /// Load main config
    pub fn load_config(&self) -> Result<Config> {
        let config_path = self.config_file();

        if !config_path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(config_path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save main config
    pub fn save_config(&self, config: &Config) -> Result<()> {
        let contents = toml::to_string_pretty(config).map_err(|e| {
            IntunePackError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;
        fs::write(self.config_file(), contents)?;
        Ok(())
    }

    /// Load all tenants
    pub fn load_tenants(&self) -> Result<Vec<TenantConfig>> {
        let tenants_path = self.tenants_file();

        if !tenants_path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(tenants_path)?;

        #[derive(Deserialize)]
        struct TenantsFile {
            #[serde(default)]
            tenants: Vec<TenantConfig>,
        }

        let file: TenantsFile = toml::from_str(&contents)?;
        Ok(file.tenants)
    }

    /// Save all tenants
    pub fn save_tenants(&self, tenants: &[TenantConfig]) -> Result<()> {
        #[derive(Serialize)]
        struct TenantsFile<'a> {
            tenants: &'a [TenantConfig],
        }

        let contents = toml::to_string_pretty(&TenantsFile { tenants }).map_err(|e| {
            IntunePackError::ConfigError(format!("Failed to serialize tenants: {}", e))
        })?;
        fs::write(self.tenants_file(), contents)?;
        Ok(())
    }

    /// Add or replace a tenant by name
    pub fn add_tenant(&self, tenant: TenantConfig) -> Result<()> {
        let mut tenants = self.load_tenants()?;
        tenants.retain(|t| t.name != tenant.name);
        tenants.push(tenant);
        self.save_tenants(&tenants)
    }

    pub fn get_tenant(&self, name: &str) -> Result<TenantConfig> {
        self.load_tenants()?
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| IntunePackError::TenantNotFound(name.to_string()))
    }

    pub fn get_active_tenant(&self) -> Result<Option<TenantConfig>> {
        let config = self.load_config()?;

        match config.current_tenant.or(config.default_tenant) {
            Some(tenant_name) => Ok(Some(self.get_tenant(&tenant_name)?)),
            None => Ok(None),
        }
    }

    pub fn set_active_tenant(&self, tenant_name: &str) -> Result<()> {
        self.get_tenant(tenant_name)?;

        let mut config = self.load_config()?;
        config.current_tenant = Some(tenant_name.to_string());
        self.save_config(&config)
    }

    /// Remove a tenant, its token cache, and the active marker if it pointed at it
    pub fn remove_tenant(&self, tenant_name: &str) -> Result<()> {
        let mut tenants = self.load_tenants()?;
        let original_len = tenants.len();
        tenants.retain(|t| !t.name.eq_ignore_ascii_case(tenant_name));

        if tenants.len() == original_len {
            return Err(IntunePackError::TenantNotFound(tenant_name.to_string()));
        }

        self.save_tenants(&tenants)?;
        let _ = self.delete_token(tenant_name);

        let mut config = self.load_config()?;
        if config
            .current_tenant
            .as_deref()
            .is_some_and(|current| current.eq_ignore_ascii_case(tenant_name))
        {
            config.current_tenant = None;
            self.save_config(&config)?;
        }

        Ok(())
    }

    pub fn save_token(&self, tenant_name: &str, token: &TokenCache) -> Result<()> {
        let cache_dir = self.config_dir.join("cache");
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir)?;
        }

        let contents = serde_json::to_string_pretty(token)?;
        fs::write(self.token_cache_file(tenant_name), contents)?;
        Ok(())
    }

    /// Load a cached token; expired tokens are reported as `AuthError`
    /// Cached token, expired or not
    pub fn load_cached_token(&self, tenant_name: &str) -> Result<Option<TokenCache>> {
        let token_path = self.token_cache_file(tenant_name);
        if !token_path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(token_path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn load_token(&self, tenant_name: &str) -> Result<TokenCache> {
        let token = self
            .load_cached_token(tenant_name)?
            .ok_or(IntunePackError::TokenNotFound)?;

        if token.expires_within(chrono::Duration::zero()) {
            return Err(IntunePackError::AuthError("Token expired".into()));
        }

        Ok(token)
    }

    pub fn delete_token(&self, tenant_name: &str) -> Result<()> {
        let token_path = self.token_cache_file(tenant_name);

        if token_path.exists() {
            fs::remove_file(token_path)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str) -> TenantConfig {
        TenantConfig {
            name: name.to_string(),
            tenant_id: "00000000-0000-0000-0000-000000000001".to_string(),
            client_id: "00000000-0000-0000-0000-000000000002".to_string(),
            client_secret: None,
            auth_type: AuthType::DeviceCode,
            description: None,
        }
    }

    #[test]
    fn test_packaging_defaults_when_section_missing() {
        let config: Config = toml::from_str("current_tenant = \"CONTOSO\"").unwrap();
        assert_eq!(config.packaging.group_prefix, "APP");
        assert_eq!(config.packaging.chunk_size_bytes().unwrap(), 6 * 1024 * 1024);
    }

    #[test]
    fn test_chunk_size_out_of_range() {
        let settings = PackagingSettings {
            chunk_size_mb: 0,
            ..Default::default()
        };
        assert!(settings.chunk_size_bytes().is_err());
    }

    #[test]
    fn test_remove_active_tenant_clears_marker() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();

        manager.add_tenant(tenant("CONTOSO")).unwrap();
        manager.add_tenant(tenant("FABRIKAM")).unwrap();
        manager.set_active_tenant("CONTOSO").unwrap();

        manager.remove_tenant("contoso").unwrap();

        assert_eq!(manager.load_tenants().unwrap().len(), 1);
        assert!(manager.load_config().unwrap().current_tenant.is_none());
        assert!(manager.get_active_tenant().unwrap().is_none());
    }

    #[test]
    fn test_expired_token_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        let token = TokenCache {
            access_token: "abc".into(),
            refresh_token: None,
            expires_at: chrono::Utc::now() - chrono::Duration::minutes(5),
            tenant_id: "t".into(),
        };
        manager.save_token("CONTOSO", &token).unwrap();

        assert!(matches!(
            manager.load_token("CONTOSO"),
            Err(IntunePackError::AuthError(_))
        ));
        assert!(matches!(
            manager.load_token("OTHER"),
            Err(IntunePackError::TokenNotFound)
        ));

        let cached = manager.load_cached_token("CONTOSO").unwrap().unwrap();
        assert_eq!(cached.access_token, "abc");
        assert!(manager.load_cached_token("OTHER").unwrap().is_none());
    }

    #[test]
    fn test_token_expiry_margin() {
        let token = TokenCache {
            access_token: "abc".into(),
            refresh_token: Some("r".into()),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(3),
            tenant_id: "t".into(),
        };
        assert!(!token.expires_within(chrono::Duration::zero()));
        assert!(token.expires_within(chrono::Duration::minutes(5)));
    }
}
