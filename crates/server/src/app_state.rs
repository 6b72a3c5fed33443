use crate::api::ApiContext;
use shared::{
    domain::Story,
    protocol::{PushAction, PushEnvelope},
};
use tokio::sync::broadcast;
use tracing::{debug, error};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) events: broadcast::Sender<PushEnvelope>,
}

impl AppState {
    /// Fans a story mutation out to every connected websocket client.
    pub(crate) fn publish(&self, action: PushAction, story: &Story) {
        let envelope = match PushEnvelope::for_story(action, story) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(story_id = %story.id, error = %err, "failed to encode push envelope");
                return;
            }
        };
        // No receivers just means no client is connected right now.
        let receivers = self.events.send(envelope).unwrap_or(0);
        debug!(story_id = %story.id, action = action.as_str(), receivers, "published story event");
    }
}
