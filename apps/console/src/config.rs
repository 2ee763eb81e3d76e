use std::collections::HashMap;
use std::fs;

use serde::Deserialize;
use shared::domain::UserRole;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_url: String,
    pub user_id: String,
    pub role: String,
    pub company_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            user_id: "dev-user".into(),
            role: "customer".into(),
            company_id: None,
        }
    }
}

/// Defaults, overlaid by `console.toml` if present, overlaid by environment
/// variables.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("console.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("user_id") {
                settings.user_id = v.clone();
            }
            if let Some(v) = file_cfg.get("role") {
                settings.role = v.clone();
            }
            if let Some(v) = file_cfg.get("company_id") {
                settings.company_id = Some(v.clone());
            }
        }
    }

    if let Ok(v) = std::env::var("CONSOLE_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CONSOLE_USER_ID") {
        settings.user_id = v;
    }
    if let Ok(v) = std::env::var("CONSOLE_ROLE") {
        settings.role = v;
    }
    if let Ok(v) = std::env::var("CONSOLE_COMPANY_ID") {
        settings.company_id = Some(v);
    }

    settings
}

pub fn parse_role(raw: &str) -> anyhow::Result<UserRole> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "customer" => Ok(UserRole::Customer),
        "company" => Ok(UserRole::Company),
        other => anyhow::bail!("unknown role '{other}', expected 'customer' or 'company'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_roles_case_insensitively() {
        assert_eq!(parse_role("Customer").unwrap(), UserRole::Customer);
        assert_eq!(parse_role(" company ").unwrap(), UserRole::Company);
    }

    #[test]
    fn rejects_unknown_roles() {
        assert!(parse_role("admin").is_err());
    }
}
