pub mod config;
pub mod principal;
pub mod schema;
pub mod state;
pub mod utils;
