use std::sync::Arc;

use parley_db::Database;
use parley_gateway::Identity;

use crate::pipeline::MessagePipeline;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub identity: Identity,
    pub pipeline: MessagePipeline,
}
