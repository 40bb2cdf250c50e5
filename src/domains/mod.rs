pub mod chat;
pub mod job;
pub mod subscription;
pub mod tier;
pub mod usage;
