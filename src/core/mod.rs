pub mod config;
pub mod desk;
pub mod error;
pub mod events;
pub mod jobs;
pub mod lifecycle;
pub mod oauth;
pub mod profiles;
pub mod terminal;
