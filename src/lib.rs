pub mod config;
pub mod db;
pub mod dtos;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod models;
pub mod realtime;
pub mod routes;
pub mod service;
pub mod utils;

use std::sync::Arc;

use config::Config;
use db::Store;
use service::{
    chat_service::{ChatHub, ChatService},
    error::ServiceError,
    escrow_service::{EscrowService, EscrowSplit},
    invitation_service::InvitationService,
    job_service::JobService,
    payment_gateway::PaymentGateway,
    review_service::{PendingReviewCache, ReviewService},
};

#[derive(Debug, Clone)]
pub struct AppState {
    pub env: Config,
    pub db_client: Arc<dyn Store>,
    pub escrow_service: Arc<EscrowService>,
    pub chat_service: Arc<ChatService>,
    pub job_service: Arc<JobService>,
    pub invitation_service: Arc<InvitationService>,
    pub review_service: Arc<ReviewService>,
}

impl AppState {
    pub fn new(
        config: Config,
        db_client: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self, ServiceError> {
        let split = EscrowSplit::new(config.downpayment_bps)?;
        let pending_reviews = Arc::new(PendingReviewCache::new());

        let escrow_service = Arc::new(EscrowService::new(db_client.clone(), gateway, split));
        let chat_service = Arc::new(ChatService::new(db_client.clone(), Arc::new(ChatHub::new())));
        let job_service = Arc::new(JobService::new(
            db_client.clone(),
            escrow_service.clone(),
            chat_service.clone(),
            pending_reviews.clone(),
        ));
        let invitation_service = Arc::new(InvitationService::new(db_client.clone(), job_service.clone()));
        let review_service = Arc::new(ReviewService::new(db_client.clone(), pending_reviews));

        Ok(Self {
            env: config,
            db_client,
            escrow_service,
            chat_service,
            job_service,
            invitation_service,
            review_service,
        })
    }
}
