//! Browser profile integrity
//!
//! The preference store at `<profile>/Default/Preferences` is rewritten by the
//! browser on every shutdown and is left truncated after a hard kill. A
//! damaged store is moved aside and replaced with an empty object so the next
//! launch never trips over it.

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Result of a profile health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileHealth {
    Healthy,
    /// No preference store yet; the browser creates one
    Missing,
    /// Store was unparseable and has been replaced by `{}`.
    /// `quarantined` is `None` when the rename failed and the file was deleted.
    Recovered { quarantined: Option<PathBuf> },
}

#[must_use]
pub fn preferences_path(profile_dir: &Path) -> PathBuf {
    profile_dir.join("Default").join("Preferences")
}

/// Check the preference store and self-heal it when it does not parse.
///
/// Never fails on corruption. Errors come only from recreating the store.
pub fn sanitize_profile(profile_dir: &Path) -> Result<ProfileHealth> {
    let path = preferences_path(profile_dir);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ProfileHealth::Missing),
        Err(e) => {
            warn!("⚠️ Cannot read {}: {}", path.display(), e);
            Vec::new()
        }
    };

    if serde_json::from_slice::<Value>(&raw).is_ok_and(|v| v.is_object()) {
        return Ok(ProfileHealth::Healthy);
    }

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let aside = path.with_file_name(format!("Preferences.corrupt.{stamp}"));

    let quarantined = match std::fs::rename(&path, &aside) {
        Ok(()) => {
            warn!("🩹 Corrupted preferences moved to {}", aside.display());
            Some(aside)
        }
        Err(e) => {
            warn!("🩹 Could not quarantine {} ({}), deleting it", path.display(), e);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to delete corrupted preferences: {}", e);
            }
            None
        }
    };

    std::fs::write(&path, b"{}")
        .with_context(|| format!("Failed to recreate {}", path.display()))?;
    Ok(ProfileHealth::Recovered { quarantined })
}

/// Preferences applied before every launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPreferences {
    pub download_dir: Option<PathBuf>,
}

impl LaunchPreferences {
    fn overlay(&self) -> Value {
        let mut prefs = json!({
            "download": { "prompt_for_download": false, "directory_upgrade": true },
            "profile": {
                "default_content_setting_values": {
                    "geolocation": 1,
                    "notifications": 2
                }
            }
        });
        if let Some(dir) = &self.download_dir {
            prefs["download"]["default_directory"] = json!(dir.to_string_lossy());
            prefs["savefile"] = json!({ "default_directory": dir.to_string_lossy() });
        }
        prefs
    }
}

/// Merge launch preferences into the profile's preference store, creating it if needed
pub fn apply_preferences(profile_dir: &Path, prefs: &LaunchPreferences) -> Result<()> {
    let path = preferences_path(profile_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create profile directory {}", parent.display()))?;
    }

    let mut current = std::fs::read(&path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Map::new()));
    merge(&mut current, prefs.overlay());

    let body = serde_json::to_vec_pretty(&current).context("Failed to serialize preferences")?;
    std::fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("🧩 Launch preferences written to {}", path.display());
    Ok(())
}

fn merge(target: &mut Value, overlay: Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, overlay) => *target = overlay,
    }
}
