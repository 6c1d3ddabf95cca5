//! Ledgerline Engine
//!
//! The transaction service that moves money between accounts and between
//! currencies on top of the double-entry ledger, the balance notification
//! hub that pushes committed balances to live subscribers, and the
//! configuration and provisioning the operator binary needs.

pub mod config;
pub mod connection;
pub mod hub;
pub mod metrics;
pub mod provisioning;
pub mod requests;
pub mod service;

pub use config::EngineConfig;
pub use connection::{serve_subscriber, CloseReason, ConnectionSettings, Inbound, SubscriberTransport, TransportError};
pub use hub::{BalanceHub, BalanceNotifier, BalanceUpdate, NoopNotifier, Subscription};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use provisioning::AccountProvisioner;
pub use requests::{ExchangeRequest, QuoteRequest, QuoteResponse, Receipt, TransferRequest};
pub use service::TransactionService;
