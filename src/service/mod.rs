pub mod background_jobs;
pub mod chat_service;
pub mod error;
pub mod escrow_service;
pub mod invitation_service;
pub mod job_service;
pub mod payment_gateway;
pub mod review_service;
