//! Reconciliation and scheduling core of the courier platform.

pub mod check_back;
pub mod check_back_client;
pub mod config_service;
pub mod lock;
pub mod postgres;
pub mod repository;
pub mod scheduler;
pub mod semaphore;
pub mod sender;
pub mod sending_timeout;
pub mod sharding;
pub mod testing;
pub mod tx_notification;
