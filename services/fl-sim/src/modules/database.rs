//! Database Module - stores pushed model sets.
use anyhow::Result;
use fl_core::coordinator::{DatabaseHandler, DbReply};
use fl_core::messages::DbMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Frame;

pub struct DatabaseModule {
    handler: DatabaseHandler,
}

impl DatabaseModule {
    pub fn new(handler: DatabaseHandler) -> Self { Self { handler } }

    pub async fn run(self, mut inbox: mpsc::Receiver<Frame>) -> Result<DatabaseHandler> {
        while let Some(frame) = inbox.recv().await {
            let msg = match DbMessage::decode(&frame) {
                Ok(m) => m,
                Err(e) => { warn!(error = %e, "dropping undecodable database frame"); continue; }
            };
            match self.handler.handle(msg)? {
                DbReply::Ack { model_id } => debug!(%model_id, "push acknowledged"),
                DbReply::NotFound(model_id) => warn!(%model_id, "model set not found"),
                other => debug!(reply = ?other, "query answered"),
            }
        }
        Ok(self.handler)
    }
}
