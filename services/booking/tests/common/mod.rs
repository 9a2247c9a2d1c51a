#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use rust_decimal::Decimal;
use uuid::Uuid;

use consultbook_auth::{AuthenticatedUser, Claims};
use consultbook_booking::{
    collaborators::{MeetingLinkProvider, Notification, NotificationType, Notifier},
    config::{BookingConfig, BookingRules, CollaboratorConfig, GatewayDeadlines, RazorpayConfig, StoreBackend},
    gateways::{
        signature, CheckoutConfig, CreateOrderRequest, GatewayError, GatewayOrder, GatewayOrderStatus,
        GatewayRefund, PaymentGateway,
    },
    orders::OrderHandle,
    reservation::ReservationRequest,
    AppState,
};
use consultbook_common::{AppError, DatabaseConfig, JwtConfig, ServerConfig, SessionType, UserRole};
use consultbook_database::{BookingStore, Client, Consultant, MemoryStore, Session, WeeklyAvailabilityPattern};

pub const KEY_SECRET: &str = "test_key_secret";
pub const WEBHOOK_SECRET: &str = "test_webhook_secret";
pub const DEADLINE_MS: u64 = 200;

/// Payment gateway double with scriptable order states and latencies.
#[derive(Default)]
pub struct ScriptedGateway {
    orders_created: AtomicUsize,
    refunds_issued: AtomicUsize,
    fail_refunds: AtomicBool,
    statuses: Mutex<HashMap<String, GatewayOrderStatus>>,
    create_delay: Mutex<Option<Duration>>,
    status_delay: Mutex<Option<Duration>>,
    refunds: Mutex<Vec<(String, i64)>>,
}

impl ScriptedGateway {
    pub fn orders_created(&self) -> usize {
        self.orders_created.load(Ordering::SeqCst)
    }

    pub fn refunds(&self) -> Vec<(String, i64)> {
        self.refunds.lock().unwrap().clone()
    }

    pub fn set_status(&self, order_id: &str, status: GatewayOrderStatus) {
        self.statuses.lock().unwrap().insert(order_id.to_string(), status);
    }

    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn set_status_delay(&self, delay: Option<Duration>) {
        *self.status_delay.lock().unwrap() = delay;
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn checkout_config(&self) -> CheckoutConfig {
        CheckoutConfig {
            key_id: "rzp_test".to_string(),
            merchant_name: "Consultbook".to_string(),
        }
    }

    async fn create_order(&self, request: &CreateOrderRequest) -> Result<GatewayOrder, GatewayError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.orders_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayOrder {
            order_id: format!("order_{}", n),
            amount_minor: request.amount_minor,
            currency: request.currency.clone(),
        })
    }

    async fn fetch_order_status(&self, order_id: &str) -> Result<GatewayOrderStatus, GatewayError> {
        let delay = *self.status_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .unwrap_or(GatewayOrderStatus::Created))
    }

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount_minor: i64,
        _notes: HashMap<String, String>,
    ) -> Result<GatewayRefund, GatewayError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected("BAD_REQUEST_ERROR: refund window closed".to_string()));
        }
        let n = self.refunds_issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.refunds.lock().unwrap().push((payment_id.to_string(), amount_minor));
        Ok(GatewayRefund {
            refund_id: format!("rfnd_{}", n),
            amount_minor,
        })
    }

    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        let payload = signature::checkout_payload(order_id, payment_id);
        signature::verify(KEY_SECRET, payload.as_bytes(), signature)
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        signature::verify(WEBHOOK_SECRET, payload, signature)
    }
}

#[derive(Default)]
pub struct RecordingMeetings {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingMeetings {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MeetingLinkProvider for RecordingMeetings {
    async fn create_meeting_link(&self, session: &Session) -> Result<Option<String>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::ExternalService("meetings down".to_string()));
        }
        Ok(Some(format!("https://meet.test/{}", session.id)))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn count(&self, notification_type: NotificationType) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.notification_type == notification_type)
            .count()
    }

    pub fn total(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), AppError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub meetings: Arc<RecordingMeetings>,
    pub notifier: Arc<RecordingNotifier>,
    pub consultant: Consultant,
    pub owner: AuthenticatedUser,
}

pub fn test_config() -> BookingConfig {
    BookingConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_origins: vec!["http://localhost:3000".to_string()],
        },
        database: DatabaseConfig::from_env(),
        store: StoreBackend::Memory,
        jwt: JwtConfig {
            secret: "test-jwt-secret".to_string(),
            expiration_hours: 1,
            issuer: "consultbook".to_string(),
        },
        booking: BookingRules::default(),
        razorpay: RazorpayConfig {
            key_id: "rzp_test".to_string(),
            key_secret: KEY_SECRET.to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            merchant_name: "Consultbook".to_string(),
            deadlines: GatewayDeadlines {
                create_order_ms: DEADLINE_MS,
                status_ms: DEADLINE_MS,
                refund_ms: DEADLINE_MS,
            },
        },
        collaborators: CollaboratorConfig {
            meetings_service_url: None,
            notifications_service_url: None,
            meeting_link_timeout_ms: DEADLINE_MS,
        },
    }
}

/// Thursday 2026-10-15 09:00 UTC.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 15, 9, 0, 0).unwrap()
}

/// The Monday after [`now`].
pub fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

pub fn ten() -> NaiveTime {
    NaiveTime::from_hms_opt(10, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

pub async fn setup() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(ScriptedGateway::default());
    let meetings = Arc::new(RecordingMeetings::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let owner = AuthenticatedUser {
        user_id: Uuid::new_v4(),
        email: "asha@consultbook.test".to_string(),
        roles: vec![UserRole::Consultant],
    };
    let consultant = Consultant {
        id: Uuid::new_v4(),
        slug: "asha".to_string(),
        display_name: "Asha Rao".to_string(),
        owner_user_id: owner.user_id,
        timezone: "UTC".to_string(),
        created_at: now(),
    };
    store.insert_consultant(&consultant).await.unwrap();
    store
        .insert_pattern(&WeeklyAvailabilityPattern {
            id: Uuid::new_v4(),
            consultant_id: consultant.id,
            session_type: SessionType::Personal,
            day_of_week: Weekday::Mon,
            start_time: ten(),
            end_time: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            slot_minutes: None,
            timezone: "UTC".to_string(),
            is_active: true,
        })
        .await
        .unwrap();

    let state = AppState::new(
        test_config(),
        store.clone(),
        gateway.clone(),
        meetings.clone(),
        notifier.clone(),
    );

    TestApp {
        state,
        store,
        gateway,
        meetings,
        notifier,
        consultant,
        owner,
    }
}

impl TestApp {
    pub async fn client(&self, email: &str) -> Client {
        self.state
            .reservations
            .register_client(self.consultant.id, "Test Client", email, None, now())
            .await
            .unwrap()
    }

    pub fn reservation(&self, client: &Client) -> ReservationRequest {
        ReservationRequest {
            consultant_id: self.consultant.id,
            session_type: SessionType::Personal,
            date: monday(),
            start_time: ten(),
            client_id: client.id,
            amount: Decimal::new(150000, 2),
            currency: "INR".to_string(),
        }
    }

    pub async fn reserve(&self, email: &str) -> Session {
        let client = self.client(email).await;
        self.state
            .reservations
            .reserve(&self.reservation(&client), now())
            .await
            .unwrap()
    }

    pub async fn reserve_with_order(&self, email: &str) -> (Session, OrderHandle) {
        let session = self.reserve(email).await;
        let order = self.state.orders.create_order(session.id, now()).await.unwrap();
        (session, order)
    }

    pub async fn session(&self, session_id: Uuid) -> Session {
        self.store.get_session(session_id).await.unwrap().unwrap()
    }

    pub fn user_for(&self, email: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: Uuid::new_v4(),
            email: email.to_string(),
            roles: vec![UserRole::Client],
        }
    }

    pub fn token_for(&self, user: &AuthenticatedUser) -> String {
        let claims = Claims::new(user.user_id, user.email.clone(), user.roles.clone(), &test_config().jwt);
        self.state.jwt_service.generate_token(&claims).unwrap()
    }
}

pub fn checkout_signature(order_id: &str, payment_id: &str) -> String {
    signature::sign(KEY_SECRET, signature::checkout_payload(order_id, payment_id).as_bytes())
}

pub fn webhook_body(event: &str, order_id: &str, payment_id: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "entity": "event",
        "event": event,
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "order_id": order_id,
                    "status": if event == "payment.failed" { "failed" } else { "captured" },
                    "error_description": if event == "payment.failed" { Some("card declined") } else { None },
                }
            }
        }
    }))
    .unwrap()
}

pub fn webhook_signature(body: &[u8]) -> String {
    signature::sign(WEBHOOK_SECRET, body)
}
