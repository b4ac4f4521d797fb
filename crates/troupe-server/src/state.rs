use std::sync::Arc;

use tokio::sync::Mutex;
use troupe::engine::TurnEngine;

/// Shared server state. The engine serializes turns, so one lock guards it;
/// concurrent requests queue rather than interleave.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Mutex<TurnEngine>>,
}

impl AppState {
    pub fn new(engine: TurnEngine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }
}
