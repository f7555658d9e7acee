pub mod config;
pub mod error;
pub mod tta;
pub mod resource;
pub mod broker;
pub mod manager;
