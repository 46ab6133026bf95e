// =============================================================================
// SSE Stream — position and order updates for UIs
// =============================================================================
//
// Subscribers receive every update the engine pushes onto the broadcast
// channel: position snapshots, order lifecycle, and risk events, each tagged
// with a `kind` and the state version it was produced at. A consumer that
// lags past the channel capacity misses updates rather than slowing the
// engine; it resynchronizes from the read endpoints.
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use tokio::sync::broadcast;
use tracing::debug;

use crate::app_state::AppState;

pub async fn stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.stream_tx.subscribe();
    debug!("sse subscriber connected");

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    let kind = update["kind"].as_str().unwrap_or("update").to_string();
                    let event = Event::default().event(kind).data(update.to_string());
                    return Some((Ok(event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "sse subscriber lagged — updates dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineEvent;
    use crate::runtime_config::RuntimeConfig;
    use futures_util::StreamExt;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn updates_flow_to_sse_subscribers() {
        let mut config = RuntimeConfig::default();
        config.kv_snapshot_path = String::new();
        let (tx, _rx) = mpsc::unbounded_channel::<EngineEvent>();
        let state = Arc::new(AppState::new(config, tx));

        let rx = state.stream_tx.subscribe();
        let mut stream = Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(update) => Some((update, rx)),
                Err(_) => None,
            }
        }));

        state.stream("position", serde_json::json!({"tradeId": "t-1"}));
        let update = stream.next().await.unwrap();
        assert_eq!(update["kind"], "position");
        assert_eq!(update["payload"]["tradeId"], "t-1");
    }
}
