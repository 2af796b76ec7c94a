use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid signing key: {0}")]
    InvalidKey(#[from] hmac::digest::InvalidLength),
}

/// Username/password pair presented to the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

// The password is a live signature; keep it out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity claims for the server-side subscription.
#[derive(Debug, Clone)]
pub struct CredentialSigner {
    pub client_id: String,
    pub access_key: String,
    pub access_secret: String,
    pub consumer_group_id: String,
    pub instance_id: String,
}

impl CredentialSigner {
    /// Sign with the current wall-clock time.
    ///
    /// The broker only accepts signatures inside its freshness window, so this
    /// must run once per connection attempt.
    pub fn sign_now(&self) -> Result<Credentials, CredentialError> {
        self.sign(jiff::Timestamp::now().as_millisecond())
    }

    pub fn sign(&self, timestamp_ms: i64) -> Result<Credentials, CredentialError> {
        let username = format!(
            "{}|authMode=aksign,signMethod=Hmacsha1,consumerGroupId={},authId={},iotInstanceId={},timestamp={}|",
            self.client_id,
            self.consumer_group_id,
            self.access_key,
            self.instance_id,
            timestamp_ms
        );
        let content = format!("authId={}&timestamp={}", self.access_key, timestamp_ms);
        let password = hmac_sha1_base64(&self.access_secret, &content)?;

        Ok(Credentials {
            client_id: self.client_id.clone(),
            username,
            password,
        })
    }

    /// Device-style signature used for publishing downlink commands.
    pub fn sign_device(
        &self,
        product_key: &str,
        timestamp_ms: i64,
    ) -> Result<Credentials, CredentialError> {
        let client_id = format!("{}@@@{}", self.client_id, self.consumer_group_id);
        let username = format!(
            "{}|securemode=2,signmethod=hmacsha1,timestamp={}|",
            self.client_id, timestamp_ms
        );
        let content = format!(
            "clientId{}deviceName{}groupId{}productKey{}timestamp{}",
            self.client_id, self.client_id, self.consumer_group_id, product_key, timestamp_ms
        );
        let password = hmac_sha1_base64(&self.access_secret, &content)?;

        Ok(Credentials {
            client_id,
            username,
            password,
        })
    }
}

fn hmac_sha1_base64(secret: &str, content: &str) -> Result<String, CredentialError> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())?;
    mac.update(content.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> CredentialSigner {
        CredentialSigner {
            client_id: "gateway".into(),
            access_key: "key-id".into(),
            access_secret: "secret".into(),
            consumer_group_id: "group-1".into(),
            instance_id: "iot-instance".into(),
        }
    }

    #[test]
    fn username_carries_every_claim() {
        let creds = signer().sign(1_700_000_000_000).unwrap();
        assert_eq!(
            creds.username,
            "gateway|authMode=aksign,signMethod=Hmacsha1,consumerGroupId=group-1,authId=key-id,iotInstanceId=iot-instance,timestamp=1700000000000|"
        );
        assert_eq!(creds.client_id, "gateway");
    }

    #[test]
    fn password_is_base64_hmac_sha1() {
        let creds = signer().sign(1_700_000_000_000).unwrap();
        assert_eq!(creds.password, "5eGmWTB9HgAhiYuJioMdEBG6PXc=");
    }

    #[test]
    fn signature_changes_with_timestamp() {
        let a = signer().sign(1_700_000_000_000).unwrap();
        let b = signer().sign(1_700_000_000_001).unwrap();
        assert_ne!(a.password, b.password);
    }

    #[test]
    fn device_signature() {
        let creds = signer().sign_device("pk1", 1_700_000_000_000).unwrap();
        assert_eq!(creds.client_id, "gateway@@@group-1");
        assert_eq!(
            creds.username,
            "gateway|securemode=2,signmethod=hmacsha1,timestamp=1700000000000|"
        );
        assert_eq!(creds.password, "Xp7hFFV406LXZYyw07y6u4jFZko=");
    }

    #[test]
    fn debug_hides_password() {
        let creds = signer().sign(1).unwrap();
        assert!(!format!("{creds:?}").contains(&creds.password));
    }
}
