use crate::config::{AuthType, ConfigManager, TenantConfig, TokenCache};
use crate::error::{IntunePackError, Result};
use colored::Colorize;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, DeviceAuthorizationUrl, EmptyExtraDeviceAuthorizationFields,
    RefreshToken, Scope, TokenResponse, TokenUrl, basic::BasicClient, reqwest::async_http_client,
};
use std::time::Duration;

const MICROSOFT_AUTHORITY: &str = "https://login.microsoftonline.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
/// Tokens expiring within this window are renewed before use
const REFRESH_MARGIN_MINUTES: i64 = 10;

/// Graph permissions the app registration needs
pub const REQUIRED_SCOPES: &[&str] = &[
    "DeviceManagementApps.ReadWrite.All",
    "Group.ReadWrite.All",
];

pub struct GraphAuth {
    config_manager: ConfigManager,
}

fn endpoints(tenant_id: &str) -> Result<(AuthUrl, TokenUrl)> {
    let auth_url = AuthUrl::new(format!(
        "{}/{}/oauth2/v2.0/authorize",
        MICROSOFT_AUTHORITY, tenant_id
    ))
    .map_err(|e| IntunePackError::AuthError(format!("Invalid auth URL: {}", e)))?;

    let token_url = TokenUrl::new(format!(
        "{}/{}/oauth2/v2.0/token",
        MICROSOFT_AUTHORITY, tenant_id
    ))
    .map_err(|e| IntunePackError::AuthError(format!("Invalid token URL: {}", e)))?;

    Ok((auth_url, token_url))
}

fn expiry(expires_in: Option<Duration>) -> Result<chrono::DateTime<chrono::Utc>> {
    let lifetime = chrono::Duration::from_std(expires_in.unwrap_or(Duration::from_secs(3600)))
        .map_err(|e| IntunePackError::AuthError(format!("Invalid token lifetime: {}", e)))?;
    Ok(chrono::Utc::now() + lifetime)
}

impl GraphAuth {
    pub fn new(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }

    /// Authenticate using device code flow (interactive)
    pub async fn login_device_code(&self, tenant_config: &TenantConfig) -> Result<TokenCache> {
        println!(
            "{} Starting device code authentication for tenant '{}'...",
            "→".cyan(),
            tenant_config.name
        );

        let tenant_id = &tenant_config.tenant_id;
        let (auth_url, token_url) = endpoints(tenant_id)?;
        let device_auth_url = DeviceAuthorizationUrl::new(format!(
            "{}/{}/oauth2/v2.0/devicecode",
            MICROSOFT_AUTHORITY, tenant_id
        ))
        .map_err(|e| IntunePackError::AuthError(format!("Invalid device auth URL: {}", e)))?;

        let client = BasicClient::new(
            ClientId::new(tenant_config.client_id.clone()),
            None,
            auth_url,
            Some(token_url),
        )
        .set_device_authorization_url(device_auth_url);

        let details: oauth2::DeviceAuthorizationResponse<EmptyExtraDeviceAuthorizationFields> =
            client
                .exchange_device_code()
                .map_err(|e| {
                    IntunePackError::AuthError(format!("Device code exchange failed: {}", e))
                })?
                .add_scope(Scope::new(GRAPH_SCOPE.to_string()))
                .request_async(async_http_client)
                .await
                .map_err(|e| {
                    IntunePackError::AuthError(format!("Device authorization request failed: {}", e))
                })?;

        println!("\n  Visit: {}", details.verification_uri().as_str().bold());
        println!("  Code:  {}\n", details.user_code().secret().bold());

        let token = client
            .exchange_device_access_token(&details)
            .request_async(async_http_client, tokio::time::sleep, None)
            .await
            .map_err(|e| IntunePackError::AuthError(format!("Token exchange failed: {}", e)))?;

        let token_cache = TokenCache {
            access_token: token.access_token().secret().clone(),
            refresh_token: token.refresh_token().map(|t| t.secret().clone()),
            expires_at: expiry(token.expires_in())?,
            tenant_id: tenant_id.clone(),
        };

        self.config_manager
            .save_token(&tenant_config.name, &token_cache)?;
        tracing::debug!(
            "Token cached at {}",
            self.config_manager
                .token_cache_file(&tenant_config.name)
                .display()
        );

        println!("{} Authentication successful", "✓".green());
        Ok(token_cache)
    }

    /// Authenticate using client credentials flow (non-interactive)
    pub async fn login_client_credentials(
        &self,
        tenant_config: &TenantConfig,
    ) -> Result<TokenCache> {
        let client_secret = tenant_config.client_secret.as_ref().ok_or_else(|| {
            IntunePackError::AuthError("Client secret required for client credentials flow".into())
        })?;

        println!(
            "{} Authenticating with client credentials for tenant '{}'...",
            "→".cyan(),
            tenant_config.name
        );

        let tenant_id = &tenant_config.tenant_id;
        let (auth_url, token_url) = endpoints(tenant_id)?;

        let client = BasicClient::new(
            ClientId::new(tenant_config.client_id.clone()),
            Some(ClientSecret::new(client_secret.clone())),
            auth_url,
            Some(token_url),
        );

        let token = client
            .exchange_client_credentials()
            .add_scope(Scope::new(GRAPH_SCOPE.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                IntunePackError::AuthError(format!("Client credentials exchange failed: {}", e))
            })?;

        let token_cache = TokenCache {
            access_token: token.access_token().secret().clone(),
            refresh_token: None,
            expires_at: expiry(token.expires_in())?,
            tenant_id: tenant_id.clone(),
        };

        self.config_manager
            .save_token(&tenant_config.name, &token_cache)?;

        println!("{} Authentication successful", "✓".green());
        Ok(token_cache)
    }

    /// Trade the cached refresh token for a new access token
    async fn refresh(&self, tenant_config: &TenantConfig, refresh_token: &str) -> Result<TokenCache> {
        let (auth_url, token_url) = endpoints(&tenant_config.tenant_id)?;
        let client = BasicClient::new(
            ClientId::new(tenant_config.client_id.clone()),
            tenant_config.client_secret.clone().map(ClientSecret::new),
            auth_url,
            Some(token_url),
        );

        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .add_scope(Scope::new(GRAPH_SCOPE.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| IntunePackError::AuthError(format!("Token refresh failed: {}", e)))?;

        let token_cache = TokenCache {
            access_token: token.access_token().secret().clone(),
            refresh_token: token
                .refresh_token()
                .map(|t| t.secret().clone())
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: expiry(token.expires_in())?,
            tenant_id: tenant_config.tenant_id.clone(),
        };
        self.config_manager
            .save_token(&tenant_config.name, &token_cache)?;
        Ok(token_cache)
    }

    /// Access token for `tenant_config`, renewed when it is close to expiry
    ///
    /// Device-code tokens renew through their refresh token, client-credential
    /// tenants sign in again. `TokenNotFound` when neither is possible.
    pub async fn get_access_token(&self, tenant_config: &TenantConfig) -> Result<String> {
        let cached = self
            .config_manager
            .load_cached_token(&tenant_config.name)?
            .ok_or(IntunePackError::TokenNotFound)?;

        if !cached.expires_within(chrono::Duration::minutes(REFRESH_MARGIN_MINUTES)) {
            return Ok(cached.access_token);
        }

        if let Some(refresh_token) = &cached.refresh_token {
            tracing::info!("Refreshing access token for tenant '{}'", tenant_config.name);
            match self.refresh(tenant_config, refresh_token).await {
                Ok(token) => return Ok(token.access_token),
                Err(e) if !cached.expires_within(chrono::Duration::zero()) => {
                    tracing::warn!("{}; using the cached token until it expires", e);
                    return Ok(cached.access_token);
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    return Err(IntunePackError::TokenNotFound);
                }
            }
        }

        if tenant_config.auth_type == AuthType::ClientCredentials
            && tenant_config.client_secret.is_some()
        {
            return Ok(self.login_client_credentials(tenant_config).await?.access_token);
        }

        if cached.expires_within(chrono::Duration::zero()) {
            Err(IntunePackError::TokenNotFound)
        } else {
            Ok(cached.access_token)
        }
    }

    pub fn logout(&self, tenant_name: &str) -> Result<()> {
        self.config_manager.delete_token(tenant_name)?;
        println!("{} Logged out from tenant '{}'", "✓".green(), tenant_name);
        Ok(())
    }
}
