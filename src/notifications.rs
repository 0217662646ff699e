// 🔔 Post-upload notifications (best-effort fan-out)

use crate::entities::MonitoringPlanRecord;
use crate::error::StoreResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: String,
    pub plan_id: Uuid,
    pub mmp_id: String,
    pub plan_name: String,
    pub uploaded_by: String,
    pub uploaded_by_name: String,
    pub entry_count: usize,
    pub message: String,
}

impl Notification {
    pub fn plan_uploaded(plan: &MonitoringPlanRecord) -> Self {
        Notification {
            kind: "plan_uploaded".to_string(),
            plan_id: plan.id,
            mmp_id: plan.mmp_id.clone(),
            plan_name: plan.name.clone(),
            uploaded_by: plan.uploaded_by.clone(),
            uploaded_by_name: plan.uploaded_by_name.clone(),
            entry_count: plan.entries,
            message: format!(
                "{} uploaded {} ({} site entries)",
                plan.uploaded_by_name, plan.name, plan.entries
            ),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> StoreResult<()>;
}

/// Default sink: writes the notification to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send(&self, notification: &Notification) -> StoreResult<()> {
        tracing::info!(
            kind = %notification.kind,
            plan_id = %notification.plan_id,
            mmp_id = %notification.mmp_id,
            entries = notification.entry_count,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Keeps sent notifications in memory (server feed, tests)
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn send(&self, notification: &Notification) -> StoreResult<()> {
        self.sent
            .lock()
            .map_err(|_| crate::error::StoreError::Poisoned)?
            .push(notification.clone());
        Ok(())
    }
}

/// Send and forget: errors and timeouts are logged, never returned
pub async fn notify_best_effort(
    sink: &dyn NotificationSink,
    notification: &Notification,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, sink.send(notification)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(plan_id = %notification.plan_id, error = %e, "notification failed");
            false
        }
        Err(_) => {
            tracing::warn!(
                plan_id = %notification.plan_id,
                timeout_secs = timeout.as_secs(),
                "notification timed out"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{generate_mmp_id, PlanStatus};
    use crate::error::StoreError;
    use chrono::Utc;

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn send(&self, _notification: &Notification) -> StoreResult<()> {
            Err(StoreError::Backend("mail relay down".to_string()))
        }
    }

    fn plan() -> MonitoringPlanRecord {
        let id = Uuid::new_v4();
        MonitoringPlanRecord {
            id,
            mmp_id: generate_mmp_id(&id),
            name: "March Plan".to_string(),
            status: PlanStatus::Active,
            entries: 12,
            processed_entries: 12,
            file_path: "mmp-files/x.csv".to_string(),
            file_url: "memory://mmp-files/x.csv".to_string(),
            original_filename: "march_plan.csv".to_string(),
            content_hash: String::new(),
            project_id: None,
            month: None,
            hub: None,
            uploaded_by: "u-1".to_string(),
            uploaded_by_name: "Amina".to_string(),
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_plan_uploaded_notification() {
        let sink = MemoryNotificationSink::new();
        let note = Notification::plan_uploaded(&plan());
        assert!(notify_best_effort(&sink, &note, Duration::from_secs(1)).await);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "plan_uploaded");
        assert_eq!(sent[0].message, "Amina uploaded March Plan (12 site entries)");
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let note = Notification::plan_uploaded(&plan());
        assert!(!notify_best_effort(&FailingSink, &note, Duration::from_secs(1)).await);
    }
}
