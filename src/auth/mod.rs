//! Presigned-query authentication (AWS Signature Version 2, query variant).
//!
//! Every request carries `AWSAccessKeyId`, `Signature` and `Expires` query
//! parameters. The signature is `Base64(HMAC-SHA1(secret, StringToSign))`
//! over the five-line form:
//!
//! ```text
//! Method \n Content-MD5 \n Content-Type \n Expires \n Path
//! ```
//!
//! with the normalized request path as the resource (no virtual-host bucket
//! rewriting) and no trailing newline.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::Config;
use crate::http::Request;
use crate::meta::MetaStore;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The verified access key; doubles as the owner id for bucket scoping.
    pub access_key: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing AWSAccessKeyId, Signature or Expires")]
    MissingParams,
    #[error("unknown access key")]
    UnknownAccessKey,
    #[error("request expired")]
    Expired,
    #[error("signature does not match")]
    SignatureMismatch,
}

/// Verify the presigned query parameters of `req`. Secrets come from the
/// metadata store, with a fallback to the configured administrator pair for
/// its own access key.
pub fn verify_presigned(
    req: &Request,
    config: &Config,
    store: &MetaStore,
) -> Result<AuthContext, AuthError> {
    let access_key = req.query_param("AWSAccessKeyId");
    let signature = req.query_param("Signature");
    let expires = req.query_param("Expires");
    let (Some(access_key), Some(signature), Some(expires)) = (access_key, signature, expires)
    else {
        return Err(AuthError::MissingParams);
    };
    if access_key.is_empty() || signature.is_empty() || expires.is_empty() {
        return Err(AuthError::MissingParams);
    }

    let secret = match store.get_secret_by_access_key(&access_key) {
        Some(s) => s,
        None if access_key == config.access_key => config.secret_key.clone(),
        None => return Err(AuthError::UnknownAccessKey),
    };

    let deadline = expires
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, b| {
            acc.saturating_mul(10).saturating_add((b - b'0') as i64)
        });
    if chrono::Utc::now().timestamp() > deadline {
        return Err(AuthError::Expired);
    }

    let string_to_sign = string_to_sign(
        &req.method,
        &req.content_md5,
        &req.content_type,
        &expires,
        &req.path,
    );
    let expected = sign(&secret, &string_to_sign);

    if expected.as_bytes().ct_eq(signature.as_bytes()).into() {
        Ok(AuthContext { access_key })
    } else {
        tracing::debug!(
            method = %req.method,
            content_md5 = %req.content_md5,
            content_type = %req.content_type,
            expires = %expires,
            path = %req.path,
            "signature mismatch; client must sign exactly these five lines"
        );
        Err(AuthError::SignatureMismatch)
    }
}

fn string_to_sign(
    method: &str,
    content_md5: &str,
    content_type: &str,
    expires: &str,
    path: &str,
) -> String {
    format!("{method}\n{content_md5}\n{content_type}\n{expires}\n{path}")
}

/// Base64(HMAC-SHA1(secret, data)) with the standard alphabet and padding.
pub fn sign(secret: &str, data: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}
