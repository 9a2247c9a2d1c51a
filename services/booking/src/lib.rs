pub mod availability;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod gateways;
pub mod handlers;
pub mod jobs;
pub mod orders;
pub mod reservation;
pub mod routes;
pub mod session_state;
pub mod sessions;
pub mod settlement;

use std::sync::Arc;

use axum::{extract::FromRef, http::HeaderValue, http::Method, Router};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use consultbook_auth::JwtService;
use consultbook_database::BookingStore;

use crate::availability::AvailabilityService;
use crate::collaborators::{MeetingLinkProvider, Notifier, SessionEffects};
use crate::config::BookingConfig;
use crate::gateways::PaymentGateway;
use crate::orders::OrderCoordinator;
use crate::reservation::ReservationManager;
use crate::sessions::SessionService;
use crate::settlement::SettlementService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BookingConfig>,
    pub jwt_service: JwtService,
    pub store: Arc<dyn BookingStore>,
    pub availability: Arc<AvailabilityService>,
    pub reservations: Arc<ReservationManager>,
    pub orders: Arc<OrderCoordinator>,
    pub settlement: Arc<SettlementService>,
    pub sessions: Arc<SessionService>,
}

impl AppState {
    /// Wires the components together. Every collaborator is passed in so
    /// tests can swap the gateway, meetings and notifications.
    pub fn new(
        config: BookingConfig,
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        meetings: Arc<dyn MeetingLinkProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let rules = config.booking.clone();
        let deadlines = config.razorpay.deadlines;

        let effects = Arc::new(SessionEffects::new(
            store.clone(),
            meetings,
            notifier,
            config.collaborators.meeting_link_timeout(),
        ));
        let settlement = Arc::new(SettlementService::new(
            store.clone(),
            gateway.clone(),
            effects.clone(),
            deadlines,
            rules.clone(),
        ));

        Self {
            jwt_service: JwtService::new(&config.jwt),
            availability: Arc::new(AvailabilityService::new(store.clone(), rules.clone())),
            reservations: Arc::new(ReservationManager::new(store.clone(), settlement.clone(), rules.clone())),
            orders: Arc::new(OrderCoordinator::new(store.clone(), gateway, deadlines)),
            sessions: Arc::new(SessionService::new(store.clone(), settlement.clone(), effects, rules)),
            settlement,
            store,
            config: Arc::new(config),
        }
    }
}

impl FromRef<AppState> for JwtService {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_service.clone()
    }
}

pub fn create_app(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(origins);

    routes::create_routes()
        .fallback(handlers::handler_404)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
