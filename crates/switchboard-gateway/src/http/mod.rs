pub mod deploy;
pub mod health;
pub mod messages;
pub mod models;
pub mod monitor;
