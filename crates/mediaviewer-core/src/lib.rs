//! Hands encrypted Matrix media off to a media viewer service.
//!
//! A media event is turned into a `POST /create` request in one of two ways,
//! and the room gets back a link whose fragment holds the secret the viewer
//! needs to show the media. The fragment never reaches the viewer.

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod forwarder;
pub mod request;

pub use client::{DEFAULT_REQUEST_TIMEOUT, ViewerClient, ViewerError};
pub use config::{ConfigError, ConfigOverrides, ConfigSource, ForwardMode, ForwarderConfig};
pub use crypto::{CryptoError, MasterSecret};
pub use error::{BuildError, ForwardError};
pub use event::{EventError, MediaEvent, SkipReason, UserId};
pub use forwarder::{Forwarder, ForwarderHandle, GENERIC_FAILURE_REPLY, Outcome};
pub use request::{Passthrough, PreparedUpload, RequestBuilder, SelfEncrypt, UploadRequest};
