//! Digest authentication retries (RFC 3261 §22, RFC 2617).
//!
//! The dialog layer recovers 401/407 challenges locally: it computes
//! the digest from stored credentials, attaches the Authorization
//! header and re-issues the request with a fresh CSeq. One attempt is
//! made per (realm, nonce); a repeat challenge with the same nonce
//! (and no `stale=true`) means the credentials are wrong.

use std::collections::HashSet;

use md5::{Digest, Md5};

use waveline_sip_core::{
    DigestChallenge, DigestCredentials, Header, HeaderAccess, HeaderName, HeaderValue, Method,
    Response, StatusCode,
};

use crate::errors::{Error, Result};

/// A stored credential. `realm: None` matches any realm.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential { username: username.into(), password: password.into(), realm: None }
    }

    pub fn for_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    fn matches(&self, realm: &str) -> bool {
        self.realm.as_deref().map(|r| r == realm).unwrap_or(true)
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// RFC 2617 digest response.
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &Method,
    uri: &str,
    qop: Option<&str>,
    cnonce: Option<&str>,
    nc: Option<&str>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match (qop, cnonce, nc) {
        (Some(qop), Some(cnonce), Some(nc)) => {
            md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        }
        _ => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// Per-dialog authentication state.
#[derive(Debug, Default)]
pub struct Authenticator {
    credentials: Vec<Credential>,
    /// (realm, nonce) pairs already answered.
    attempted: HashSet<(String, String)>,
    cnonce_counter: u32,
}

impl Authenticator {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Authenticator { credentials, attempted: HashSet::new(), cnonce_counter: 0 }
    }

    pub fn has_credentials(&self) -> bool {
        !self.credentials.is_empty()
    }

    /// Answer a 401/407. Returns the header to attach to the retried
    /// request, or an error when credentials are missing or already
    /// exhausted against this challenge.
    pub fn answer_challenge(
        &mut self,
        response: &Response,
        method: &Method,
        request_uri: &str,
    ) -> Result<Header> {
        let (challenge_name, answer_name) = match response.status {
            StatusCode::Unauthorized => (HeaderName::WwwAuthenticate, HeaderName::Authorization),
            StatusCode::ProxyAuthenticationRequired => {
                (HeaderName::ProxyAuthenticate, HeaderName::ProxyAuthorization)
            }
            other => {
                return Err(Error::AuthFailed(format!("{} is not a challenge", other.as_u16())));
            }
        };

        let challenge = match response.header(&challenge_name).map(|h| &h.value) {
            Some(HeaderValue::Challenge(ch)) => ch.clone(),
            _ => {
                return Err(Error::AuthFailed("challenge response without challenge".to_string()));
            }
        };

        let credential = self
            .credentials
            .iter()
            .find(|c| c.matches(&challenge.realm))
            .cloned()
            .ok_or_else(|| {
                Error::AuthFailed(format!("no credentials for realm {}", challenge.realm))
            })?;

        let attempt_key = (challenge.realm.clone(), challenge.nonce.clone());
        if self.attempted.contains(&attempt_key) && !challenge.stale {
            return Err(Error::AuthFailed(format!(
                "credentials rejected for realm {}",
                challenge.realm
            )));
        }
        self.attempted.insert(attempt_key);

        let credentials = self.build_credentials(&challenge, &credential, method, request_uri);
        Ok(Header::new(answer_name, HeaderValue::Credentials(credentials)))
    }

    fn build_credentials(
        &mut self,
        challenge: &DigestChallenge,
        credential: &Credential,
        method: &Method,
        uri: &str,
    ) -> DigestCredentials {
        // qop="auth" requires the cnonce/nc machinery.
        let use_qop = challenge
            .qop
            .as_deref()
            .map(|q| q.split(',').any(|t| t.trim() == "auth"))
            .unwrap_or(false);

        let (qop, cnonce, nc) = if use_qop {
            self.cnonce_counter += 1;
            (
                Some("auth".to_string()),
                Some(format!("{:08x}", rand::random::<u32>())),
                Some(format!("{:08}", self.cnonce_counter)),
            )
        } else {
            (None, None, None)
        };

        let response = digest_response(
            &credential.username,
            &credential.password,
            &challenge.realm,
            &challenge.nonce,
            method,
            uri,
            qop.as_deref(),
            cnonce.as_deref(),
            nc.as_deref(),
        );

        DigestCredentials {
            username: credential.username.clone(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            opaque: challenge.opaque.clone(),
            algorithm: Some("MD5".to_string()),
            qop,
            cnonce,
            nc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveline_sip_core::parse_response;

    fn challenge_response() -> Response {
        parse_response(
            b"SIP/2.0 401 Unauthorized\r\n\
              Via: SIP/2.0/UDP a.com;branch=z9hG4bKauth\r\n\
              To: <sip:bob@biloxi.com>;tag=b\r\nFrom: <sip:alice@atlanta.com>;tag=a\r\n\
              Call-ID: auth-test\r\nCSeq: 1 REGISTER\r\n\
              WWW-Authenticate: Digest realm=\"biloxi.com\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\"\r\n\r\n",
        )
        .unwrap()
    }

    #[test]
    fn rfc2617_reference_vector() {
        // The RFC 2617 example (GET, no qop) translated to our API.
        let response = digest_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            &Method::Extension("GET".to_string()),
            "/dir/index.html",
            None,
            None,
            None,
        );
        assert_eq!(response, "1949323746fe6a43ef61f9606e7febea");
    }

    #[test]
    fn challenge_produces_authorization_header() {
        let mut auth = Authenticator::new(vec![Credential::new("bob", "zanzibar")]);
        let header = auth
            .answer_challenge(&challenge_response(), &Method::Register, "sip:biloxi.com")
            .unwrap();
        assert_eq!(header.name, HeaderName::Authorization);
        match header.value {
            HeaderValue::Credentials(cred) => {
                assert_eq!(cred.realm, "biloxi.com");
                assert_eq!(cred.username, "bob");
                assert_eq!(cred.response.len(), 32);
            }
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn repeat_nonce_exhausts_credentials() {
        let mut auth = Authenticator::new(vec![Credential::new("bob", "zanzibar")]);
        let resp = challenge_response();
        assert!(auth.answer_challenge(&resp, &Method::Register, "sip:biloxi.com").is_ok());
        // Same nonce again, not stale: the password was wrong.
        assert!(matches!(
            auth.answer_challenge(&resp, &Method::Register, "sip:biloxi.com"),
            Err(Error::AuthFailed(_))
        ));
    }

    #[test]
    fn missing_credentials_fail() {
        let mut auth = Authenticator::new(vec![
            Credential::new("bob", "zanzibar").for_realm("elsewhere.example"),
        ]);
        assert!(matches!(
            auth.answer_challenge(&challenge_response(), &Method::Register, "sip:biloxi.com"),
            Err(Error::AuthFailed(_))
        ));
    }
}
