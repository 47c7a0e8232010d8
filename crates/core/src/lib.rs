pub mod config;
pub mod connection_manager;
pub mod credentials;
pub mod pagination;
pub mod query_engine;
pub mod query_window;
pub mod registry;
pub mod startup;
pub mod store;
