//! MQTT implementation of [`Middleware`](crate::middleware::Middleware).

mod client;
pub(crate) mod outbox;
mod session;
pub mod settings;

pub use client::MqttMiddleware;
pub use settings::{BrokerAddress, MqttSettings, Scheme, TlsFiles};

use std::path::Path;

use pkcs8::{EncryptedPrivateKeyInfo, LineEnding, SecretDocument};
use rumqttc::{QoS, TlsConfiguration, Transport};

use crate::error::{BridgeError, Result};
use crate::middleware::Qos;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

pub(crate) fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Build the TLS transport from the configured files.
///
/// Without a CA file the platform trust store is used.
pub(crate) fn load_transport(files: &TlsFiles) -> Result<Transport> {
    let Some(ca_path) = &files.ca_cert else {
        return Ok(Transport::tls_with_default_config());
    };

    let ca = read_pem("ca_cert_file", ca_path)?;
    let client_auth = match (&files.client_cert, &files.client_key) {
        (Some(cert), Some(key)) => {
            let mut key_pem = read_pem("client_key_file", key)?;
            if let Some(password) = &files.key_password {
                key_pem = unlock_key(&key_pem, password)?;
            }
            Some((read_pem("client_cert_file", cert)?, key_pem))
        }
        _ => None,
    };

    Ok(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

/// Decrypt an encrypted PKCS#8 PEM key into a plain PKCS#8 PEM key.
///
/// Keys that are not encrypted are returned unchanged.
pub(crate) fn unlock_key(pem: &[u8], password: &str) -> Result<Vec<u8>> {
    let invalid = |reason: String| BridgeError::invalid_setting("key_password", "<redacted>", reason);

    let text = std::str::from_utf8(pem).map_err(|_| invalid("client key is not PEM text".into()))?;
    let (label, document) = SecretDocument::from_pem(text)
        .map_err(|e| invalid(format!("cannot read client key: {}", e)))?;
    if label != ENCRYPTED_KEY_LABEL {
        tracing::debug!(label, "Client key is not encrypted; ignoring key_password");
        return Ok(pem.to_vec());
    }

    let info = EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|e| invalid(format!("cannot parse encrypted key: {}", e)))?;
    let decrypted = info
        .decrypt(password)
        .map_err(|e| invalid(format!("cannot decrypt client key: {}", e)))?;
    let plain = decrypted
        .to_pem("PRIVATE KEY", LineEnding::LF)
        .map_err(|e| invalid(format!("cannot encode client key: {}", e)))?;
    Ok(plain.as_bytes().to_vec())
}

fn read_pem(key: &str, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| BridgeError::invalid_setting(key, path.display().to_string(), e.to_string()))
}
