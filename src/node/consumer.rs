use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::bus::KafkaEventStream;
use crate::node::state::NodeState;

/// Bus consumer loop: applies every presence event for an owned vnode to
/// the local view. Receive errors back off briefly so a broker outage does
/// not spin the loop.
pub async fn run_consumer(
    state: Arc<NodeState>,
    stream: KafkaEventStream,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = stream.next_event() => match next {
                Ok(Some(event)) => {
                    if state.apply_event(&event).await {
                        tracing::debug!(
                            user_id = %event.user_id,
                            action = ?event.action,
                            source = %event.node_id,
                            "applied presence event"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "bus receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
    stream.disconnect();
    tracing::info!("bus consumer stopped");
}
