pub mod achievements;
pub mod api_router;
pub mod core;
pub mod feed;
pub mod notifications;
pub mod shared;
