pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod lifecycle;
mod main_lib;
pub mod registry;
pub mod source;
pub mod subscriber;

pub use main_lib::{build_state, init_tracing, AppState};
