//! Deciding when a device status change is worth telling the user about
//!
//! Discovery redelivers the same status many times; both trackers here
//! make sure each transition is reported once.

use beamlink_core::status::{code, is_retry_prompt_state};
use beamlink_core::{DeviceDescriptor, Report};
use std::collections::{HashMap, HashSet};

/// What happened to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Completed,
    Aborted,
    PausedFromError(String),
    /// A new error label appeared
    Error(String),
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Self::Completed => "Job completed".to_string(),
            Self::Aborted => "Job aborted".to_string(),
            Self::PausedFromError(label) => format!("Job paused: {label}"),
            Self::Error(label) => label.clone(),
        }
    }

    /// Error labels are alerts; the rest are desktop notifications the user can turn off
    pub fn is_alert(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uuid: String,
    pub name: String,
    pub notice: Notice,
}

/// Tracks running jobs and error labels across discovery snapshots
#[derive(Debug, Default)]
pub struct NotificationTracker {
    /// Devices seen running whose outcome hasn't been reported
    unnotified: HashSet<String>,
    error_labels: HashMap<String, String>,
}

impl NotificationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(&mut self, devices: &[DeviceDescriptor]) -> Vec<Notification> {
        let mut out = Vec::new();
        for device in devices {
            let label = device.error_label.as_deref().filter(|l| !l.is_empty());
            let notify = |notice| Notification {
                uuid: device.uuid.clone(),
                name: device.name.clone(),
                notice,
            };

            match label {
                Some(label) if self.error_labels.get(&device.uuid).map(String::as_str) != Some(label) => {
                    self.error_labels.insert(device.uuid.clone(), label.to_string());
                    out.push(notify(Notice::Error(format!("{}: {label}", device.name))));
                }
                Some(_) => {}
                None => {
                    self.error_labels.remove(&device.uuid);
                }
            }

            match device.st_id {
                code::RUNNING => {
                    self.unnotified.insert(device.uuid.clone());
                }
                code::COMPLETED | code::ABORTED | code::PAUSED_FROM_RUNNING
                    if self.unnotified.contains(&device.uuid) =>
                {
                    let notice = match (device.st_id, label) {
                        (code::COMPLETED, _) => Notice::Completed,
                        (code::ABORTED, _) => Notice::Aborted,
                        (_, Some(label)) => Notice::PausedFromError(label.to_string()),
                        // Paused without an error yet; wait for the label
                        (_, None) => continue,
                    };
                    self.unnotified.remove(&device.uuid);
                    out.push(notify(notice));
                }
                _ => {}
            }
        }
        out
    }
}

/// Lets one retry prompt through per distinct mid-job error
#[derive(Debug, Default)]
pub struct RetryPromptGate {
    showing: bool,
    last: Option<(String, i32, Vec<String>)>,
}

impl RetryPromptGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `report` should raise a retry prompt now
    pub fn should_prompt(&mut self, uuid: &str, report: &Report) -> bool {
        if !is_retry_prompt_state(report.st_id) || report.error.is_empty() {
            if self.last.as_ref().is_some_and(|(last, ..)| last == uuid) {
                self.last = None;
            }
            return false;
        }
        if self.showing {
            return false;
        }

        let occurrence = (uuid.to_string(), report.st_id, report.error.clone());
        if self.last.as_ref() == Some(&occurrence) {
            return false;
        }
        self.last = Some(occurrence);
        self.showing = true;
        true
    }

    pub fn dismissed(&mut self) {
        self.showing = false;
    }
}
