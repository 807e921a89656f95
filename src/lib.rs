// Re-export main modules for the perpetual engine library

use std::sync::Arc;

pub mod book;
pub mod config;
pub mod engine;
pub mod error;
pub mod fixed;
pub mod funding;
pub mod liquidation;
pub mod matching;
pub mod position;
pub mod repo;
pub mod risk;
pub mod settlement;
pub mod store;
pub mod types;
pub mod ws;

pub use engine::Engine;
pub use types::*;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}
