use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

pub const SECTION_KEY: &str = "setup.imports";

#[derive(Debug, Clone, PartialEq)]
pub struct ImportSettings {
    /// Email domains treated as internal accounts; empty means every domain is internal.
    pub internal_domains: Vec<String>,
    pub session_ttl_minutes: i64,
    pub require_warning_acknowledgement: bool,
    pub default_owner: String,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            internal_domains: Vec::new(),
            session_ttl_minutes: 60,
            require_warning_acknowledgement: true,
            default_owner: "staff".to_string(),
        }
    }
}

impl ImportSettings {
    pub fn to_json(&self) -> Value {
        json!({
            "internalDomains": self.internal_domains,
            "sessionTtlMinutes": self.session_ttl_minutes,
            "requireWarningAcknowledgement": self.require_warning_acknowledgement,
            "defaultOwner": self.default_owner,
        })
    }

    pub fn is_internal_email(&self, email: &str) -> bool {
        if self.internal_domains.is_empty() {
            return true;
        }
        let Some((_, domain)) = email.rsplit_once('@') else {
            return false;
        };
        self.internal_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }

    /// Applies a partial update. Unknown fields and out-of-range values are rejected.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match k.as_str() {
                "internalDomains" => {
                    let Some(items) = v.as_array() else {
                        return Err("internalDomains must be an array of strings".to_string());
                    };
                    let mut domains = Vec::with_capacity(items.len());
                    for item in items {
                        let Some(s) = item.as_str() else {
                            return Err("internalDomains must be an array of strings".to_string());
                        };
                        let d = s.trim().trim_start_matches('@').to_ascii_lowercase();
                        if d.is_empty() || d.contains('@') || d.contains(char::is_whitespace) {
                            return Err(format!("invalid domain: {}", s));
                        }
                        domains.push(d);
                    }
                    domains.sort();
                    domains.dedup();
                    self.internal_domains = domains;
                }
                "sessionTtlMinutes" => {
                    let Some(n) = v.as_i64() else {
                        return Err("sessionTtlMinutes must be an integer".to_string());
                    };
                    if !(1..=7 * 24 * 60).contains(&n) {
                        return Err("sessionTtlMinutes must be between 1 and 10080".to_string());
                    }
                    self.session_ttl_minutes = n;
                }
                "requireWarningAcknowledgement" => {
                    let Some(b) = v.as_bool() else {
                        return Err("requireWarningAcknowledgement must be a boolean".to_string());
                    };
                    self.require_warning_acknowledgement = b;
                }
                "defaultOwner" => {
                    let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                        return Err("defaultOwner must be a non-empty string".to_string());
                    };
                    if s.chars().count() > 120 {
                        return Err("defaultOwner is too long".to_string());
                    }
                    self.default_owner = s.to_string();
                }
                _ => return Err(format!("unknown imports field: {}", k)),
            }
        }
        Ok(())
    }
}

pub fn load(conn: &Connection) -> anyhow::Result<ImportSettings> {
    let mut current = ImportSettings::default();
    if let Some(saved) = db::settings_get_json(conn, SECTION_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults instead of blocking imports.
            let mut candidate = current.clone();
            match candidate.apply_patch(saved_obj) {
                Ok(()) => current = candidate,
                Err(msg) => tracing::warn!(%msg, "ignoring stored import settings"),
            }
        }
    }
    Ok(current)
}

pub fn save(conn: &Connection, settings: &ImportSettings) -> anyhow::Result<()> {
    db::settings_set_json(conn, SECTION_KEY, &settings.to_json())
}
