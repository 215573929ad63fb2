use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use shared::domain::{Role, UserId};

pub const MB: u64 = 1024 * 1024;

/// Who the engine acts as. Token refresh is owned by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    pub session_token: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role, session_token: impl Into<String>) -> Self {
        Self {
            user_id: UserId(user_id.into()),
            role,
            session_token: session_token.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentScope {
    Chat,
    Project,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentLimits {
    pub chat_max_bytes: u64,
    pub project_max_bytes: u64,
    pub image_max_bytes: u64,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            chat_max_bytes: 50 * MB,
            project_max_bytes: 10 * MB,
            image_max_bytes: 5 * MB,
        }
    }
}

impl AttachmentLimits {
    pub fn max_bytes(&self, scope: AttachmentScope) -> u64 {
        match scope {
            AttachmentScope::Chat => self.chat_max_bytes,
            AttachmentScope::Project => self.project_max_bytes,
            AttachmentScope::Image => self.image_max_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Outages shorter than this are never reported as errors.
    pub outage_grace: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            outage_grace: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): doubles per attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub page_size: u32,
    pub load_timeout: Duration,
    pub reconcile_fallback: Duration,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub attachment_limits: AttachmentLimits,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            page_size: 50,
            load_timeout: Duration::from_secs(5),
            reconcile_fallback: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            attachment_limits: AttachmentLimits::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    page_size: Option<u32>,
    load_timeout_ms: Option<u64>,
    reconcile_fallback_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    outage_grace_ms: Option<u64>,
    max_chat_attachment_bytes: Option<u64>,
    max_project_attachment_bytes: Option<u64>,
    max_image_bytes: Option<u64>,
}

impl FileSettings {
    fn apply(self, settings: &mut ClientSettings) {
        if let Some(v) = self.server_url {
            settings.server_url = v;
        }
        if let Some(v) = self.page_size {
            settings.page_size = v.max(1);
        }
        if let Some(v) = self.load_timeout_ms {
            settings.load_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.reconcile_fallback_ms {
            settings.reconcile_fallback = Duration::from_millis(v);
        }
        if let Some(v) = self.request_timeout_ms {
            settings.request_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.reconnect_initial_ms {
            settings.reconnect.initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.reconnect_max_ms {
            settings.reconnect.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.outage_grace_ms {
            settings.reconnect.outage_grace = Duration::from_millis(v);
        }
        if let Some(v) = self.max_chat_attachment_bytes {
            settings.attachment_limits.chat_max_bytes = v;
        }
        if let Some(v) = self.max_project_attachment_bytes {
            settings.attachment_limits.project_max_bytes = v;
        }
        if let Some(v) = self.max_image_bytes {
            settings.attachment_limits.image_max_bytes = v;
        }
    }
}

/// Defaults, then the optional TOML file, then `CHAT__*` environment overrides.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    if let Some(path) = path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read client settings '{}'", path.display()))?;
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("invalid client settings '{}'", path.display()))?;
        file_cfg.apply(&mut settings);
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_env_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    let millis = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(v) = lookup("CHAT__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("CHAT__PAGE_SIZE").and_then(|v| v.trim().parse::<u32>().ok()) {
        settings.page_size = v.max(1);
    }
    if let Some(v) = millis("CHAT__LOAD_TIMEOUT_MS") {
        settings.load_timeout = Duration::from_millis(v);
    }
    if let Some(v) = millis("CHAT__RECONCILE_FALLBACK_MS") {
        settings.reconcile_fallback = Duration::from_millis(v);
    }
    if let Some(v) = millis("CHAT__OUTAGE_GRACE_MS") {
        settings.reconnect.outage_grace = Duration::from_millis(v);
    }
    if let Some(v) = millis("CHAT__MAX_CHAT_ATTACHMENT_BYTES") {
        settings.attachment_limits.chat_max_bytes = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
