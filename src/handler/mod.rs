pub mod chat;
pub mod jobs;
pub mod ws;
