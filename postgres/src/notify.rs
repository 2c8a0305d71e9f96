//! Position notifications over `LISTEN/NOTIFY`.
//!
//! Every push notifies the channel with the position of its last event,
//! formatted as `position:in_position_order`. Notifications are hints: when
//! the listener connection drops, notifications sent meanwhile are lost and
//! subscribers rely on polling to catch up.

use crate::sql::db_error;
use eventstore_core::error::Result;
use eventstore_core::position::GlobalPosition;
use eventstore_core::store::PositionStream;
use sqlx::PgPool;
use sqlx::postgres::PgListener;

/// Open a listener on `channel`.
pub(crate) async fn listen(pool: &PgPool, channel: &str) -> Result<PositionStream> {
    let mut listener = PgListener::connect_with(pool).await.map_err(db_error)?;
    listener.listen(channel).await.map_err(db_error)?;
    tracing::debug!(channel, "Listening for positions");

    let channel = channel.to_string();
    Ok(Box::pin(async_stream::stream! {
        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => match notification.payload().parse::<GlobalPosition>() {
                    Ok(position) => yield position,
                    Err(e) => tracing::warn!(channel = %channel, error = %e, "Ignoring malformed notification"),
                },
                // reconnects on the next call
                Ok(None) => tracing::warn!(channel = %channel, "Listener connection lost, reconnecting"),
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Listener failed");
                    break;
                }
            }
        }
    }))
}
