use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntunePackError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Graph API error: {0}")]
    GraphApiError(String),

    #[error("Packaging error: {0}")]
    PackagingError(String),

    #[error("Encryption error: {0}")]
    CryptoError(String),

    #[error("Upload failed: {0}")]
    UploadError(String),

    #[error("External tool failed: {0}")]
    ProcessError(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("ZIP error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    XmlError(#[from] quick_xml::Error),

    #[error("Directory walk error: {0}")]
    WalkDirError(#[from] walkdir::Error),

    #[error("Interactive prompt error: {0}")]
    DialoguerError(#[from] dialoguer::Error),

    #[error("Token not found. Please run 'intunepack login' first")]
    TokenNotFound,

    #[error("Tenant '{0}' not found")]
    TenantNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, IntunePackError>;

/// Parse Graph API error response and provide helpful context
pub fn enhance_graph_error(error_response: &str) -> String {
    if let Ok(error_json) = serde_json::from_str::<serde_json::Value>(error_response) {
        if let Some(error_obj) = error_json.get("error") {
            let code = error_obj
                .get("code")
                .and_then(|c| c.as_str())
                .unwrap_or("Unknown");
            let message = error_obj
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("No message");

            let hint = match code {
                "Unauthorized" | "InvalidAuthenticationToken" => {
                    "\nHint: your token may have expired. Run 'intunepack login' again."
                }
                "Forbidden" | "Authorization_RequestDenied" | "InsufficientPrivileges" => {
                    "\nHint: the app registration needs DeviceManagementApps.ReadWrite.All and Group.ReadWrite.All with admin consent."
                }
                "BadRequest" => {
                    if message.contains("already exists") {
                        "\nHint: an object with this name already exists in the tenant."
                    } else if message.contains("detectionRules") {
                        "\nHint: check the [[detection]] entries of the app manifest."
                    } else {
                        "\nHint: the request body was rejected. Check the app manifest values."
                    }
                }
                "NotFound" | "Request_ResourceNotFound" | "ResourceNotFound" => {
                    "\nHint: the requested object doesn't exist. Check the app or group ID."
                }
                "TooManyRequests" => "\nHint: Graph throttled the request. Wait a moment and try again.",
                _ => "",
            };

            return format!("{}: {}{}", code, message, hint);
        }
    }

    error_response.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enhance_graph_error_adds_hint() {
        let body = r#"{"error":{"code":"Forbidden","message":"Access denied"}}"#;
        let enhanced = enhance_graph_error(body);
        assert!(enhanced.starts_with("Forbidden: Access denied"));
        assert!(enhanced.contains("Group.ReadWrite.All"));
    }

    #[test]
    fn test_enhance_graph_error_passes_through_plain_text() {
        assert_eq!(enhance_graph_error("gateway timeout"), "gateway timeout");
    }
}
