//! Request construction for the two forwarding strategies
//!
//! Both strategies turn one [`MediaEvent`] into a [`PreparedUpload`]: the JSON
//! body for `POST /create` and the secret that only ever travels in the reply
//! URL fragment.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::ForwardMode;
use crate::crypto::{
    self, CryptoError, MasterSecret, decode_unpadded, encode_unpadded, key_digest,
    sign_file_reference,
};
use crate::error::BuildError;
use crate::event::MediaEvent;

/// `info` members that describe the thumbnail and are not forwarded
const STRIPPED_INFO_KEYS: [&str; 2] = ["thumbnail_file", "thumbnail_info"];

/// Body of `POST {media_viewer_url}/create`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UploadRequest {
    /// The bot encrypted the event content itself
    SelfEncrypted {
        ciphertext: String,
        auth_token: String,
        homeserver: String,
    },
    /// The Matrix file reference, signed with its own key
    Passthrough {
        iv: String,
        sha256: String,
        url: String,
        info: Map<String, Value>,
        key_sha256: String,
        signature: String,
    },
}

/// The URL fragment of a reply
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Fragment(String);

impl Fragment {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Fragment(***)")
    }
}

/// A request ready to send, plus the fragment for the reply
#[derive(Debug, Clone)]
pub struct PreparedUpload {
    request: UploadRequest,
    fragment: Fragment,
}

impl PreparedUpload {
    pub fn new(request: UploadRequest, fragment: Fragment) -> Self {
        Self { request, fragment }
    }

    pub fn request(&self) -> &UploadRequest {
        &self.request
    }

    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    /// `{base_url}/{file_id}#{fragment}`
    pub fn reply_url(&self, base_url: &str, file_id: &str) -> String {
        format!(
            "{}/{}#{}",
            base_url.trim_end_matches('/'),
            file_id,
            self.fragment.as_str()
        )
    }
}

/// Turns a media event into a viewer request
pub trait RequestBuilder: Send + Sync {
    fn mode(&self) -> ForwardMode;

    fn build(&self, event: &MediaEvent) -> Result<PreparedUpload, BuildError>;
}

/// Supplies fresh master secrets to [`SelfEncrypt`]
pub trait SecretSource: Send + Sync {
    fn next_secret(&self) -> Result<MasterSecret, CryptoError>;
}

/// Secrets from the operating system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSecretSource;

impl SecretSource for OsSecretSource {
    fn next_secret(&self) -> Result<MasterSecret, CryptoError> {
        MasterSecret::generate()
    }
}

impl<F> SecretSource for F
where
    F: Fn() -> Result<MasterSecret, CryptoError> + Send + Sync,
{
    fn next_secret(&self) -> Result<MasterSecret, CryptoError> {
        self()
    }
}

/// Encrypts the whole event content under a fresh secret
#[derive(Debug, Clone, Default)]
pub struct SelfEncrypt<S = OsSecretSource> {
    source: S,
}

impl SelfEncrypt {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S: SecretSource> SelfEncrypt<S> {
    pub fn with_source(source: S) -> Self {
        Self { source }
    }
}

impl<S: SecretSource> RequestBuilder for SelfEncrypt<S> {
    fn mode(&self) -> ForwardMode {
        ForwardMode::SelfEncrypt
    }

    fn build(&self, event: &MediaEvent) -> Result<PreparedUpload, BuildError> {
        let secret = self.source.next_secret()?;
        let payload = Zeroizing::new(event.content_json()?);
        let sealed = crypto::seal_metadata(&secret, &payload)?;

        let request = UploadRequest::SelfEncrypted {
            ciphertext: encode_unpadded(&sealed.ciphertext),
            auth_token: encode_unpadded(&sealed.auth_token),
            homeserver: event.sender.server_name().to_string(),
        };
        Ok(PreparedUpload::new(request, Fragment(secret.to_fragment())))
    }
}

/// Forwards the Matrix file reference and proves possession of its key
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl RequestBuilder for Passthrough {
    fn mode(&self) -> ForwardMode {
        ForwardMode::Passthrough
    }

    fn build(&self, event: &MediaEvent) -> Result<PreparedUpload, BuildError> {
        let file = event.file()?;
        file.validate_url()?;

        let key = Zeroizing::new(decode_unpadded(&file.key.key, "file key")?);
        let signature = sign_file_reference(&key, &file.url, &file.hashes.sha256, &file.iv)?;

        let mut info = event.info().cloned().unwrap_or_default();
        for stripped in STRIPPED_INFO_KEYS {
            info.shift_remove(stripped);
        }
        if let Some(body) = event.body() {
            info.insert("filename".to_string(), Value::String(body.to_string()));
        }

        let request = UploadRequest::Passthrough {
            key_sha256: key_digest(&key),
            signature: encode_unpadded(&signature),
            iv: file.iv,
            sha256: file.hashes.sha256,
            url: file.url,
            info,
        };
        Ok(PreparedUpload::new(request, Fragment(file.key.key)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::crypto::{SECRET_LEN, open_metadata, verify_file_reference};
    use crate::event::tests::encrypted_image_content;
    use crate::event::{EventError, UserId};

    fn alice() -> UserId {
        UserId::parse("@alice:example.org").unwrap()
    }

    fn zero_source() -> Result<MasterSecret, CryptoError> {
        Ok(MasterSecret::from_bytes([0u8; SECRET_LEN]))
    }

    fn image_event(content: Value) -> MediaEvent {
        MediaEvent::new("$event", "!room:example.org", alice(), content).unwrap()
    }

    #[test]
    fn self_encrypt_golden_request() {
        let builder = SelfEncrypt::with_source(zero_source);
        let event = image_event(json!({"msgtype": "m.image", "body": "x"}));
        let prepared = builder.build(&event).unwrap();

        assert_eq!(
            prepared.request(),
            &UploadRequest::SelfEncrypted {
                ciphertext: "BnV85OfVNICdpIXcF5x9XZxpUcMSDk/NZsPB8Xqv+yTjn0Czn+91c+T5L4ZA0LrN"
                    .to_string(),
                auth_token: "/3Jk+QQOwHE2/eIXpny4BqLgnNYl68UtPKB2cPDr3L0".to_string(),
                homeserver: "example.org".to_string(),
            }
        );
        assert_eq!(prepared.fragment().as_str(), "AAAAAAAAAAAAAAAAAAAAAA");
        assert_eq!(
            prepared.reply_url("https://media.example.com/", "f1"),
            "https://media.example.com/f1#AAAAAAAAAAAAAAAAAAAAAA"
        );
    }

    #[test]
    fn self_encrypt_ciphertext_opens_with_fragment() {
        let builder = SelfEncrypt::new();
        let content = encrypted_image_content();
        let prepared = builder.build(&image_event(content.clone())).unwrap();

        let UploadRequest::SelfEncrypted { ciphertext, .. } = prepared.request() else {
            panic!("expected self-encrypted request");
        };
        let secret = MasterSecret::from_fragment(prepared.fragment().as_str()).unwrap();
        let ciphertext = decode_unpadded(ciphertext, "ciphertext").unwrap();
        let plaintext = open_metadata(&secret, &ciphertext).unwrap();
        let decoded: Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn self_encrypt_request_never_carries_secret() {
        let builder = SelfEncrypt::new();
        let prepared = builder.build(&image_event(encrypted_image_content())).unwrap();
        let body = serde_json::to_string(prepared.request()).unwrap();
        assert!(!body.contains(prepared.fragment().as_str()));
        assert_eq!(
            serde_json::from_str::<Value>(&body)
                .unwrap()
                .as_object()
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn self_encrypt_secrets_are_fresh() {
        let builder = SelfEncrypt::new();
        let event = image_event(encrypted_image_content());
        let a = builder.build(&event).unwrap();
        let b = builder.build(&event).unwrap();
        assert_ne!(a.fragment(), b.fragment());
        assert_ne!(a.request(), b.request());
    }

    #[test]
    fn self_encrypt_surfaces_random_failure() {
        let builder = SelfEncrypt::with_source(|| -> Result<MasterSecret, CryptoError> {
            Err(CryptoError::Random("no entropy".into()))
        });
        let err = builder
            .build(&image_event(encrypted_image_content()))
            .unwrap_err();
        assert_eq!(err.kind(), "random");
    }

    #[test]
    fn passthrough_golden_request() {
        let prepared = Passthrough
            .build(&image_event(encrypted_image_content()))
            .unwrap();

        let expected = json!({
            "iv": "AAAAAAAAAAAAAAAAAAAAAA",
            "sha256": "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU",
            "url": "mxc://example.org/abcdefghijklmnop",
            "info": {
                "mimetype": "image/png",
                "w": 640,
                "h": 480,
                "size": 31337,
                "filename": "cat.png"
            },
            "key_sha256": "Yw3NKWbEM2aRElRIu7JbT/QSpJxzLbLIq8G4WBvXEN0",
            "signature": "Ed/Xuow665fnBmu0YGQ2EFcYlTdt+6u/10FG0ie4kiQ"
        });
        assert_eq!(serde_json::to_value(prepared.request()).unwrap(), expected);
        assert_eq!(
            prepared.fragment().as_str(),
            "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8"
        );
    }

    #[test]
    fn passthrough_signature_verifies_server_side() {
        let prepared = Passthrough
            .build(&image_event(encrypted_image_content()))
            .unwrap();
        let UploadRequest::Passthrough {
            iv,
            sha256,
            url,
            signature,
            ..
        } = prepared.request()
        else {
            panic!("expected passthrough request");
        };
        let key = decode_unpadded(prepared.fragment().as_str(), "file key").unwrap();
        verify_file_reference(&key, url, sha256, iv, signature).unwrap();
        assert!(verify_file_reference(&[0u8; 32], url, sha256, iv, signature).is_err());
    }

    #[test]
    fn passthrough_without_info_still_names_file() {
        let mut content = encrypted_image_content();
        content.as_object_mut().unwrap().remove("info");
        let prepared = Passthrough.build(&image_event(content)).unwrap();
        let UploadRequest::Passthrough { info, .. } = prepared.request() else {
            panic!("expected passthrough request");
        };
        assert_eq!(info.len(), 1);
        assert_eq!(info["filename"], "cat.png");
    }

    #[test]
    fn passthrough_rejects_bad_key_encoding() {
        let mut content = encrypted_image_content();
        content["file"]["key"]["k"] = json!("not base64!");
        let err = Passthrough.build(&image_event(content)).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Crypto(CryptoError::InvalidBase64 { field: "file key" })
        ));
    }

    #[test]
    fn passthrough_rejects_short_and_empty_keys() {
        for (k, got) in [("", 0), ("AAAA", 3), ("AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHg", 31)] {
            let mut content = encrypted_image_content();
            content["file"]["key"]["k"] = json!(k);
            let err = Passthrough.build(&image_event(content)).unwrap_err();
            assert!(
                matches!(
                    err,
                    BuildError::Crypto(CryptoError::InvalidLength { field: "file key", got: g, .. })
                        if g == got
                ),
                "{k:?}: {err:?}"
            );
        }
    }

    #[test]
    fn passthrough_rejects_invalid_content_uri() {
        let mut content = encrypted_image_content();
        content["file"]["url"] = json!("https://example.org/abc");
        let err = Passthrough.build(&image_event(content)).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Event(EventError::InvalidContentUri(_))
        ));
    }

    #[test]
    fn untagged_requests_round_trip_by_shape() {
        let body = json!({
            "ciphertext": "abc",
            "auth_token": "def",
            "homeserver": "example.org"
        });
        let parsed: UploadRequest = serde_json::from_value(body).unwrap();
        assert!(matches!(parsed, UploadRequest::SelfEncrypted { .. }));
    }

    #[test]
    fn fragment_debug_is_redacted() {
        let prepared = SelfEncrypt::with_source(zero_source)
            .build(&image_event(json!({"msgtype": "m.image", "body": "x", "file": {}})))
            .unwrap();
        assert!(!format!("{prepared:?}").contains("AAAAAAAAAAAAAAAAAAAAAA"));
    }
}
