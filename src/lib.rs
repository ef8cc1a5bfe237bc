pub mod api;
pub mod chat;
pub mod config;
pub mod duel;
pub mod gateway;
pub mod identity;
pub mod ledger;
pub mod metrics;
pub mod presence;
pub mod relay;
