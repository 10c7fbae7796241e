//! Outbound notifications
//!
//! Only newly created records are announced, and only while the global
//! rate limit has budget. Storage never depends on any of this: a suppressed
//! or failed notification leaves the record intact.
//!
//! Actual delivery (Web Push with VAPID and payload encryption) belongs to a
//! `PushSender` implementation supplied by the host. The default sender only
//! logs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{NotificationConfig, RateLimitConfig};
use crate::parser::{LogLevel, truncate_chars};
use crate::store::ErrorRecord;

const BODY_MAX_CHARS: usize = 200;

// ============================================================================
// Rate limiting
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Fixed-window counter over one global bucket
pub struct RateLimiter {
    enabled: bool,
    max_notifications: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<Window>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: config.enabled,
            max_notifications: config.max_notifications,
            window: Duration::try_minutes(config.window_minutes).unwrap_or(Duration::MAX),
            clock,
            state: Mutex::new(None),
        }
    }

    /// Take one slot if the current window has any left
    pub fn allow(&self) -> bool {
        if !self.enabled {
            return true;
        }

        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = Window {
            started_at: now,
            count: 0,
        };
        if state.is_none_or(|w| self.window_over(w, now)) {
            *state = Some(fresh);
        }
        let window = state.get_or_insert(fresh);

        if window.count < self.max_notifications {
            window.count += 1;
            true
        } else {
            false
        }
    }

    /// Slots left in the current window
    pub fn remaining(&self) -> u32 {
        if !self.enabled {
            return u32::MAX;
        }
        let now = self.clock.now();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            Some(w) if !self.window_over(w, now) => self.max_notifications.saturating_sub(w.count),
            _ => self.max_notifications,
        }
    }

    /// A window whose end is not representable never closes
    fn window_over(&self, window: Window, now: DateTime<Utc>) -> bool {
        window
            .started_at
            .checked_add_signed(self.window)
            .is_some_and(|end| now >= end)
    }
}

// ============================================================================
// Payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationData {
    pub id: i64,
    pub level: String,
    pub url: String,
    pub timestamp: String,
}

/// Push payload for one error record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub require_interaction: bool,
    pub tag: String,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    pub fn for_record(record: &ErrorRecord, config: &NotificationConfig) -> Self {
        let mut body = record.message.clone();
        if body.chars().count() > BODY_MAX_CHARS {
            truncate_chars(&mut body, BODY_MAX_CHARS - 3);
            body.push_str("...");
        }

        Self {
            title: config.title.clone(),
            body,
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            require_interaction: config.require_interaction,
            tag: format!("log-error-{}", record.id),
            data: NotificationData {
                id: record.id,
                level: record.level.as_str().to_string(),
                url: format!(
                    "{}/errors/{}",
                    config.dashboard_url.trim_end_matches('/'),
                    record.id
                ),
                timestamp: record.last_occurred_at.to_rfc3339(),
            },
            actions: vec![
                NotificationAction {
                    action: "view".into(),
                    title: "View Details".into(),
                },
                NotificationAction {
                    action: "resolve".into(),
                    title: "Mark Resolved".into(),
                },
            ],
        }
    }
}

// ============================================================================
// Delivery
// ============================================================================

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Logs notifications instead of delivering them
#[derive(Debug, Default)]
pub struct TracingSender;

#[async_trait]
impl PushSender for TracingSender {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            tag = %notification.tag,
            level = %notification.data.level,
            body = %notification.body,
            "Error notification"
        );
        Ok(())
    }
}

pub struct NotificationDispatcher {
    limiter: RateLimiter,
    sender: Arc<dyn PushSender>,
    config: NotificationConfig,
}

impl NotificationDispatcher {
    pub fn new(limiter: RateLimiter, sender: Arc<dyn PushSender>, config: NotificationConfig) -> Self {
        Self {
            limiter,
            sender,
            config,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Whether `level` is one notifications are wanted for
    pub fn wants(&self, level: LogLevel) -> bool {
        self.config.levels.is_empty() || self.config.levels.contains(&level)
    }

    /// Announce a newly stored record. Returns whether a send was attempted.
    /// Unwanted levels are skipped before they use up rate-limit budget.
    pub async fn dispatch(&self, record: &ErrorRecord) -> bool {
        if !self.wants(record.level) {
            debug!(id = record.id, level = %record.level, "Notification not wanted for level");
            return false;
        }
        if !self.limiter.allow() {
            debug!(id = record.id, "Notification suppressed by rate limit");
            return false;
        }

        let notification = Notification::for_record(record, &self.config);
        if let Err(e) = self.sender.send(&notification).await {
            warn!(id = record.id, error = %e, "Failed to send notification");
        }
        true
    }
}
