//! HTTP surface of the dispatch pipeline.
//!
//! - `POST /api/notifications`: submit a notification
//! - `GET  /api/notifications/{id}`: the stored notification
//! - `GET  /api/notifications/{id}/status`: delivery status report
//! - `GET  /api/users/{user_id}/notifications`: a user's notifications
//! - `GET  /health`

pub mod routes;
pub mod state;
