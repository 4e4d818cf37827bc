pub mod adapters;
pub mod cache;
pub mod channel;
pub mod classify;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod filter;
pub mod gateway;
pub mod group;
pub mod log;
pub mod login;
pub mod media;
pub mod message;
pub mod normalize;
pub mod outbound;
pub mod pipeline;
pub mod plugins;
pub mod pool;
pub mod reply;
pub mod scheduler;
pub mod transcode;
pub mod trigger;
pub mod xml;

#[cfg(test)]
pub(crate) mod testing;
