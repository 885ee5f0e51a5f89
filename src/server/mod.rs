pub mod auth;
pub mod chats;
pub mod config;
pub mod database;
pub mod gateway;
pub mod protocol;
pub mod provisioner;
pub mod rooms;
