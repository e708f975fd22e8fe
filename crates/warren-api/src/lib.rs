pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod pagination;
pub mod users;

use std::sync::Arc;

use warren_db::Database;
use warren_gateway::dispatcher::Dispatcher;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    /// Server secret for signed password-reset credentials.
    pub secret: String,
}
