//! The media forwarding pipeline
//!
//! Every inbound event goes through the same steps: guard, build, upload,
//! reply. Only the build step differs between modes; see [`RequestBuilder`].

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client::ViewerClient;
use crate::config::{ForwardMode, ForwarderConfig};
use crate::error::ForwardError;
use crate::event::{MediaEvent, SkipReason, UserId};
use crate::request::{Passthrough, RequestBuilder, SelfEncrypt};

/// The only reply a room ever sees when forwarding fails
pub const GENERIC_FAILURE_REPLY: &str = "Error requesting media viewer URL, see logs for details";

#[derive(Debug)]
pub enum Outcome {
    /// The guard rejected the event; nothing was sent
    Skipped(SkipReason),
    Linked { reply: String, file_id: String },
    Failed(ForwardError),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped(_) => "skipped",
            Self::Linked { .. } => "linked",
            Self::Failed(_) => "failed",
        }
    }

    /// Text to post in the room, if any
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::Skipped(_) => None,
            Self::Linked { reply, .. } => Some(reply.as_str()),
            Self::Failed(_) => Some(GENERIC_FAILURE_REPLY),
        }
    }
}

pub struct Forwarder {
    bot_user_id: UserId,
    builder: Arc<dyn RequestBuilder>,
    client: ViewerClient,
}

impl Forwarder {
    pub fn new(bot_user_id: UserId, builder: Arc<dyn RequestBuilder>, client: ViewerClient) -> Self {
        Self {
            bot_user_id,
            builder,
            client,
        }
    }

    pub fn from_config(config: &ForwarderConfig, bot_user_id: UserId) -> Self {
        let builder: Arc<dyn RequestBuilder> = match config.mode {
            ForwardMode::SelfEncrypt => Arc::new(SelfEncrypt::new()),
            ForwardMode::Passthrough => Arc::new(Passthrough),
        };
        let client =
            ViewerClient::new(config.media_viewer_url.as_str()).with_timeout(config.request_timeout);
        Self::new(bot_user_id, builder, client)
    }

    pub fn bot_user_id(&self) -> &UserId {
        &self.bot_user_id
    }

    pub fn mode(&self) -> ForwardMode {
        self.builder.mode()
    }

    pub fn viewer_url(&self) -> &str {
        self.client.base_url()
    }

    pub async fn handle(&self, event: &MediaEvent) -> Outcome {
        let mode = self.mode();
        if let Some(reason) = event.skip_reason(&self.bot_user_id) {
            debug!(
                event_id = %event.event_id,
                room_id = %event.room_id,
                reason = reason.as_str(),
                "skipping event"
            );
            return Outcome::Skipped(reason);
        }

        match self.forward(event).await {
            Ok((reply, file_id)) => {
                info!(
                    event_id = %event.event_id,
                    room_id = %event.room_id,
                    %mode,
                    %file_id,
                    "media viewer link created"
                );
                Outcome::Linked { reply, file_id }
            }
            Err(err) => {
                warn!(
                    event_id = %event.event_id,
                    room_id = %event.room_id,
                    %mode,
                    error.kind = err.kind(),
                    error = %err,
                    "failed to request media viewer url"
                );
                Outcome::Failed(err)
            }
        }
    }

    async fn forward(&self, event: &MediaEvent) -> Result<(String, String), ForwardError> {
        let prepared = self.builder.build(event)?;
        let file_id = self.client.create(prepared.request()).await?;
        let reply = prepared.reply_url(self.client.base_url(), &file_id);
        Ok((reply, file_id))
    }
}

/// Current forwarder snapshot, swapped whole on reload
pub struct ForwarderHandle {
    current: RwLock<Arc<Forwarder>>,
}

impl ForwarderHandle {
    pub fn new(forwarder: Forwarder) -> Self {
        Self {
            current: RwLock::new(Arc::new(forwarder)),
        }
    }

    pub fn current(&self) -> Arc<Forwarder> {
        self.current.read().clone()
    }

    /// Later [`current`](Self::current) calls see `forwarder`; in-flight events keep theirs
    pub fn replace(&self, forwarder: Forwarder) -> Arc<Forwarder> {
        std::mem::replace(&mut *self.current.write(), Arc::new(forwarder))
    }
}
