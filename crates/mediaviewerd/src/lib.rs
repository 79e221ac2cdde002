//! Host-facing side of the media viewer bot: the JSONL daemon plus the
//! one-shot `link` and `derive` commands.

use anyhow::{Context, bail};
use mediaviewer_core::crypto::{self, MasterSecret};
use mediaviewer_core::{ConfigSource, EventError, Forwarder, MediaEvent, Outcome, UserId};
use serde::{Deserialize, Serialize};

pub mod daemon;

pub const DEFAULT_LOG_FILTER: &str = "mediaviewerd=info,mediaviewer_core=info";

/// A room message as the host hands it over
#[derive(Debug, Clone, Deserialize)]
pub struct EventFile {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub content: serde_json::Value,
}

impl EventFile {
    pub fn into_event(self) -> Result<MediaEvent, EventError> {
        let sender = UserId::parse(&self.sender)?;
        MediaEvent::new(self.event_id, self.room_id, sender, self.content)
    }
}

/// Run one event through the pipeline and return the reply text
pub async fn link_event(
    source: &ConfigSource,
    bot_user_id: UserId,
    event: EventFile,
) -> anyhow::Result<String> {
    let config = source.load().context("load configuration")?;
    let event = event.into_event().context("parse event")?;
    let forwarder = Forwarder::from_config(&config, bot_user_id);

    match forwarder.handle(&event).await {
        Outcome::Linked { reply, .. } => Ok(reply),
        Outcome::Skipped(reason) => bail!("event not forwarded: {}", reason.as_str()),
        Outcome::Failed(err) => Err(anyhow::Error::new(err).context("forward event")),
    }
}

/// What the viewer derives from a link fragment
#[derive(Debug, Serialize)]
pub struct DerivedView {
    /// Auth token the viewer presents to fetch the ciphertext
    pub auth_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

pub fn derive_view(fragment: &str, ciphertext: Option<&str>) -> anyhow::Result<DerivedView> {
    let secret = MasterSecret::from_fragment(fragment).context("parse fragment")?;
    let keys = crypto::derive_keys(&secret).context("derive keys")?;

    let metadata = match ciphertext {
        Some(ciphertext) => {
            let ciphertext =
                crypto::decode_unpadded(ciphertext, "ciphertext").context("decode ciphertext")?;
            let plaintext = crypto::open(&keys, &ciphertext).context("decrypt metadata")?;
            Some(serde_json::from_slice(&plaintext).context("metadata is not JSON")?)
        }
        None => None,
    };

    Ok(DerivedView {
        auth_token: crypto::encode_unpadded(&keys.auth_token),
        metadata,
    })
}
