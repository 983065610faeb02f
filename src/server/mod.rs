pub mod auth;
pub mod calls;
pub mod config;
pub mod conversations;
pub mod database;
pub mod http;
pub mod live_channel;
pub mod pipeline;
pub mod rooms;
pub mod socket;
