//! Narrow interfaces to the user-facing side: prompts, notifications, settings

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::Config;

/// Asks the user for input on behalf of the registry
#[async_trait]
pub trait Prompt: Send + Sync {
    /// Password for a protected device, `None` if the user declines
    async fn password(&self, caption: &str) -> Option<String>;

    /// Whether to resume a job the firmware paused with an error
    async fn confirm_retry(&self, caption: &str) -> bool;
}

/// Shows a message to the user
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Persisted preferences
pub trait SettingsStore: Send + Sync {
    fn read_setting(&self, key: &str) -> Option<String>;
}

/// Prompts on the controlling terminal
pub struct ConsolePrompt;

#[async_trait]
impl Prompt for ConsolePrompt {
    async fn password(&self, caption: &str) -> Option<String> {
        let caption = caption.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            dialoguer::Password::new()
                .with_prompt(caption)
                .allow_empty_password(true)
                .interact()
        })
        .await;

        match answer {
            Ok(Ok(password)) => Some(password),
            Ok(Err(e)) => {
                warn!(error = %e, "Password prompt failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "Password prompt task failed");
                None
            }
        }
    }

    async fn confirm_retry(&self, caption: &str) -> bool {
        let caption = caption.to_string();
        tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(caption)
                .default(false)
                .interact()
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }
}

/// Writes notifications to the log
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        info!(title, message, "Notification");
    }
}

/// Settings backed by the configuration file
pub struct ConfigSettings {
    values: HashMap<String, String>,
}

impl ConfigSettings {
    pub fn new(config: &Config) -> Self {
        let mut values = HashMap::new();
        values.insert(
            "notification".to_string(),
            if config.notification.enabled { "1" } else { "0" }.to_string(),
        );
        values.insert("poke-ip-addr".to_string(), config.discovery.poke_ips.join(";"));
        Self { values }
    }
}

impl SettingsStore for ConfigSettings {
    fn read_setting(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}
