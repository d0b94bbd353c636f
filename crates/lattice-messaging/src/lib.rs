pub mod direct;
pub mod error;
pub mod group;
pub mod notify;

mod views;

pub use direct::{DirectMessaging, ReadReceipt};
pub use error::ChatError;
pub use group::GroupMessaging;
pub use notify::{LogEmitter, NotificationEmitter};

use std::sync::Arc;

use lattice_db::Database;

/// Runs blocking rusqlite work on the tokio blocking pool so service calls
/// never stall the event loop for unrelated connections.
pub(crate) async fn run_blocking<T, F>(db: &Arc<Database>, f: F) -> Result<T, ChatError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, ChatError> + Send + 'static,
{
    let db = Arc::clone(db);
    match tokio::task::spawn_blocking(move || f(&db)).await {
        Ok(result) => result,
        Err(e) => Err(ChatError::Storage(anyhow::anyhow!(
            "blocking task failed: {e}"
        ))),
    }
}
