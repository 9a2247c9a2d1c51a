use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use consultbook_common::{bounded_call, AppError};
use consultbook_database::{BookingStore, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    BookingConfirmed,
    PaymentFailed,
    SessionCancelled,
    RefundProcessed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification_type: NotificationType,
    pub session_id: Uuid,
    pub consultant_id: Uuid,
    pub client_id: Uuid,
    pub scheduled_start: DateTime<Utc>,
    pub meeting_link: Option<String>,
    pub detail: Option<String>,
}

impl Notification {
    pub fn for_session(notification_type: NotificationType, session: &Session, detail: Option<String>) -> Self {
        Self {
            notification_type,
            session_id: session.id,
            consultant_id: session.consultant_id,
            client_id: session.client_id,
            scheduled_start: session.scheduled_start,
            meeting_link: session.meeting_link.clone(),
            detail,
        }
    }
}

/// Creates the video meeting for a confirmed session. `Ok(None)` means no
/// provider is configured.
#[async_trait]
pub trait MeetingLinkProvider: Send + Sync {
    async fn create_meeting_link(&self, session: &Session) -> Result<Option<String>, AppError>;
}

/// Fire-and-forget delivery of booking notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct HttpMeetingLinkProvider {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MeetingCreated {
    join_url: String,
}

impl HttpMeetingLinkProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MeetingLinkProvider for HttpMeetingLinkProvider {
    async fn create_meeting_link(&self, session: &Session) -> Result<Option<String>, AppError> {
        let response = self
            .client
            .post(format!("{}/meetings", self.base_url))
            .json(&json!({
                "session_id": session.id,
                "consultant_id": session.consultant_id,
                "starts_at": session.scheduled_start,
                "ends_at": session.scheduled_end,
            }))
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("meetings service unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalService(format!(
                "meetings service returned {}",
                response.status()
            )));
        }
        let created: MeetingCreated = response
            .json()
            .await
            .map_err(|e| AppError::ExternalService(format!("bad meetings response: {}", e)))?;
        Ok(Some(created.join_url))
    }
}

/// Used when no meetings service is configured.
pub struct NoMeetingLinks;

#[async_trait]
impl MeetingLinkProvider for NoMeetingLinks {
    async fn create_meeting_link(&self, session: &Session) -> Result<Option<String>, AppError> {
        tracing::debug!(session_id = %session.id, "No meetings service configured");
        Ok(None)
    }
}

#[derive(Clone)]
pub struct HttpNotifier {
    client: Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), AppError> {
        let response = self
            .client
            .post(format!("{}/notifications", self.base_url))
            .json(notification)
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("notifications service unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(AppError::ExternalService(format!(
                "notifications service returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), AppError> {
        tracing::info!(
            notification_type = ?notification.notification_type,
            session_id = %notification.session_id,
            "Notification"
        );
        Ok(())
    }
}

/// Side effects of session state changes. Failures are logged and never
/// propagated: a confirmed session stays confirmed without a link or email.
pub struct SessionEffects {
    store: Arc<dyn BookingStore>,
    meetings: Arc<dyn MeetingLinkProvider>,
    notifier: Arc<dyn Notifier>,
    meeting_link_timeout: Duration,
}

impl SessionEffects {
    pub fn new(
        store: Arc<dyn BookingStore>,
        meetings: Arc<dyn MeetingLinkProvider>,
        notifier: Arc<dyn Notifier>,
        meeting_link_timeout: Duration,
    ) -> Self {
        Self {
            store,
            meetings,
            notifier,
            meeting_link_timeout,
        }
    }

    /// Runs once per session, by whichever signal won settlement.
    pub async fn on_confirmed(&self, session: &Session, now: DateTime<Utc>) {
        let mut confirmed = session.clone();
        if let Some(link) = self.ensure_meeting_link(session, now).await {
            confirmed.meeting_link = Some(link);
        }
        self.notify(NotificationType::BookingConfirmed, &confirmed, None).await;
    }

    /// Creates and stores a meeting link when the session has none. Returns
    /// the new link.
    pub async fn ensure_meeting_link(&self, session: &Session, now: DateTime<Utc>) -> Option<String> {
        if session.meeting_link.is_some() {
            return None;
        }
        let created = bounded_call(
            "create_meeting_link",
            self.meeting_link_timeout,
            self.meetings.create_meeting_link(session),
        )
        .await;

        match created {
            Ok(Some(link)) => match self.store.set_meeting_link(session.id, &link, now).await {
                Ok(()) => {
                    tracing::info!(session_id = %session.id, "Meeting link attached");
                    Some(link)
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "Failed to store meeting link");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Meeting link creation failed, will retry");
                None
            }
        }
    }

    pub async fn notify(&self, notification_type: NotificationType, session: &Session, detail: Option<String>) {
        let notification = Notification::for_session(notification_type, session, detail);
        if let Err(e) = self.notifier.notify(&notification).await {
            tracing::warn!(
                session_id = %session.id,
                notification_type = ?notification_type,
                error = %e,
                "Notification delivery failed"
            );
        }
    }
}
