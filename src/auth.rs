use crate::error::Error;
use hmac::{Hmac, Mac};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::Method;
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-auth-apikey");
const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("x-auth-signature");

/// The parts of an outgoing REST request a signer may look at
#[derive(Debug, Clone)]
pub struct SignableRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

impl SignableRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            body: None,
        }
    }
}

/// Adds authentication headers to REST requests.
///
/// Injected explicitly into [`RestSnapshotEndpoint`](crate::RestSnapshotEndpoint),
/// [`RestCatalog`](crate::RestCatalog) and [`RestTicker`](crate::RestTicker);
/// nothing in the crate reaches for ambient credentials.
pub trait AuthProvider: Send + Sync {
    fn sign(&self, request: &SignableRequest) -> Result<Vec<(HeaderName, HeaderValue)>, Error>;
}

/// HMAC-SHA256 signing with `X-AUTH-APIKEY` / `X-AUTH-SIGNATURE` headers.
///
/// The signature is the hex digest of the compact JSON body (`{}` when the
/// request has none) keyed with the API secret.
pub struct HmacAuth {
    api_key: String,
    secret: String,
}

impl HmacAuth {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }

    pub fn signature(&self, payload: &str) -> Result<String, Error> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Auth(format!("invalid secret: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for HmacAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacAuth")
            .field("api_key", &self.api_key)
            .field("secret", &"***")
            .finish()
    }
}

impl AuthProvider for HmacAuth {
    fn sign(&self, request: &SignableRequest) -> Result<Vec<(HeaderName, HeaderValue)>, Error> {
        // serde_json's Display is the compact form
        let payload = match &request.body {
            Some(body) => body.to_string(),
            None => "{}".to_string(),
        };
        let signature = self.signature(&payload)?;

        let api_key = HeaderValue::from_str(&self.api_key)
            .map_err(|e| Error::Auth(format!("API key is not a valid header value: {}", e)))?;
        let signature = HeaderValue::from_str(&signature)
            .map_err(|e| Error::Auth(format!("invalid signature header: {}", e)))?;

        Ok(vec![
            (CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (API_KEY_HEADER, api_key),
            (SIGNATURE_HEADER, signature),
        ])
    }
}
