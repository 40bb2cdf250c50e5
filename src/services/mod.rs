pub mod chat;
pub mod context;
pub mod gate;
pub mod ledger;
pub mod streaming;
pub mod subscription;
pub mod tier_policy;
pub mod usage;
