//! HTTP handlers for vip-service.

pub mod internal;
pub mod payments;
pub mod users;
pub mod webhook;
pub mod withdrawals;
