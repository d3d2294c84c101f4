//! HTTP Digest authentication (RFC 2617).
//!
//! [`AuthSession`] holds the client side of a challenge/response
//! exchange: it answers `WWW-Authenticate`/`Proxy-Authenticate`
//! challenges with fresh credentials, keeping the nonce count and retry
//! budget. [`DigestVerifier`] is the server side: it issues challenges
//! and validates the credentials that come back.

use std::collections::HashMap;
use std::fmt::Write;

use md5::{Digest, Md5};

use asip_util::ArcStr;

use crate::error::{Error, Result};
use crate::message::auth::{DigestChallenge, DigestCredential};

const QOP_AUTH: &str = "auth";
const QOP_AUTH_INT: &str = "auth-int";
const ALGORITHM_MD5_SESS: &str = "MD5-sess";

/// Default number of credentialed retries before giving up.
pub const DEFAULT_AUTH_RETRIES: u32 = 3;

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut out = String::with_capacity(32);
    for b in &digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn md5_fields(fields: &[&str]) -> String {
    md5_hex(fields.join(":").as_bytes())
}

/// Selects the quality of protection from a challenge offer.
///
/// The offer may be a comma separated list; `auth` is preferred over
/// `auth-int`.
fn select_qop(challenge: &DigestChallenge) -> Option<&'static str> {
    let offer = challenge.qop.as_ref()?;
    let mut auth_int = false;
    for part in offer.split(',') {
        let part = part.trim();
        if part.eq_ignore_ascii_case(QOP_AUTH) {
            return Some(QOP_AUTH);
        }
        if part.eq_ignore_ascii_case(QOP_AUTH_INT) {
            auth_int = true;
        }
    }
    auth_int.then_some(QOP_AUTH_INT)
}

/// Computes the RFC 2617 `response` value.
///
/// `nc` is the one-based nonce count; `cnonce` must be given whenever
/// the challenge selects a qop or the `MD5-sess` algorithm.
#[allow(clippy::too_many_arguments)]
pub fn digest_response(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    body: Option<&[u8]>,
    cnonce: Option<&str>,
    nc: u32,
) -> String {
    let realm = challenge.realm.as_deref().unwrap_or("");
    let nonce = challenge.nonce.as_deref().unwrap_or("");
    let qop = select_qop(challenge);

    let mut ha1 = md5_fields(&[username, realm, password]);
    if challenge
        .algorithm
        .as_deref()
        .is_some_and(|a| a.eq_ignore_ascii_case(ALGORITHM_MD5_SESS))
    {
        ha1 = md5_fields(&[&ha1, nonce, cnonce.unwrap_or("")]);
    }

    let ha2 = if qop == Some(QOP_AUTH_INT) {
        let body_hash = md5_hex(body.unwrap_or_default());
        md5_fields(&[method, uri, &body_hash])
    } else {
        md5_fields(&[method, uri])
    };

    match qop {
        None => md5_fields(&[&ha1, nonce, &ha2]),
        Some(qop) => {
            let nc = format!("{:08x}", nc);
            md5_fields(&[&ha1, nonce, &nc, cnonce.unwrap_or(""), qop, &ha2])
        }
    }
}

/// Client side authentication state for one dialog.
pub struct AuthSession {
    challenge: DigestChallenge,
    /// `true` when answering a 407 (`Proxy-Authenticate`).
    proxy: bool,
    username: ArcStr,
    password: ArcStr,
    cnonce: ArcStr,
    nc: u32,
    attempts: u32,
}

impl AuthSession {
    /// Starts a session from a received challenge.
    pub fn new(challenge: DigestChallenge, proxy: bool, username: &str, password: &str) -> Self {
        Self {
            challenge,
            proxy,
            username: username.into(),
            password: password.into(),
            cnonce: format!("{:08x}", rand::random::<u32>()).into(),
            nc: 0,
            attempts: 0,
        }
    }

    /// Replaces the challenge after a `stale=true` rechallenge, keeping
    /// the nonce count history.
    pub fn rechallenge(&mut self, challenge: DigestChallenge, proxy: bool) {
        if self.challenge.nonce != challenge.nonce {
            self.nc = 0;
            self.cnonce = format!("{:08x}", rand::random::<u32>()).into();
        }
        self.challenge = challenge;
        self.proxy = proxy;
    }

    /// Whether these credentials answer a proxy challenge.
    pub fn is_proxy(&self) -> bool {
        self.proxy
    }

    /// Number of credentialed retries performed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Counts a retry against the budget, failing when it is exhausted.
    pub fn take_attempt(&mut self, budget: u32) -> Result<()> {
        self.attempts += 1;
        if self.attempts > budget {
            return Err(Error::AuthenticationFailed("too many unauthorized attempts"));
        }
        Ok(())
    }

    /// Produces credentials for the next request, bumping the nonce
    /// count.
    pub fn credentials(&mut self, method: &str, uri: &str, body: Option<&[u8]>) -> DigestCredential {
        self.nc += 1;

        let qop = select_qop(&self.challenge);
        let sess = self
            .challenge
            .algorithm
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(ALGORITHM_MD5_SESS));
        let needs_cnonce = qop.is_some() || sess;

        let response = digest_response(
            &self.challenge,
            &self.username,
            &self.password,
            method,
            uri,
            body,
            needs_cnonce.then_some(self.cnonce.as_str()),
            self.nc,
        );

        DigestCredential {
            username: Some(self.username.clone()),
            realm: self.challenge.realm.clone(),
            nonce: self.challenge.nonce.clone(),
            uri: Some(uri.into()),
            response: Some(response.into()),
            algorithm: self.challenge.algorithm.clone(),
            cnonce: needs_cnonce.then(|| self.cnonce.clone()),
            opaque: self.challenge.opaque.clone(),
            qop: qop.map(|q| q.into()),
            nc: qop.map(|_| format!("{:08x}", self.nc).into()),
        }
    }
}

/// Server side digest validation for one dialog.
///
/// Tracks the nonce count per `(cnonce, nonce)` pair so replayed
/// requests are rejected.
pub struct DigestVerifier {
    challenge: DigestChallenge,
    seen_nc: HashMap<(ArcStr, ArcStr), u32>,
}

impl DigestVerifier {
    /// Creates a verifier issuing a fresh nonce for `realm`.
    pub fn new(realm: &str) -> Self {
        let nonce = format!("{:016x}", rand::random::<u64>());
        Self {
            challenge: DigestChallenge::new(realm, &nonce),
            seen_nc: HashMap::new(),
        }
    }

    /// Creates a verifier around an explicit challenge.
    pub fn with_challenge(challenge: DigestChallenge) -> Self {
        Self {
            challenge,
            seen_nc: HashMap::new(),
        }
    }

    /// The challenge to put into the `WWW-Authenticate` header.
    pub fn challenge(&self) -> &DigestChallenge {
        &self.challenge
    }

    /// Mutable access to the challenge, for adjusting the qop offer.
    pub fn challenge_mut(&mut self) -> &mut DigestChallenge {
        &mut self.challenge
    }

    /// Validates credentials against the stored challenge.
    ///
    /// Recomputes the response from the client supplied fields and
    /// rejects nonce counts that have not strictly increased for the
    /// `(cnonce, nonce)` pair.
    pub fn verify(
        &mut self,
        credential: &DigestCredential,
        method: &str,
        password: &str,
        body: Option<&[u8]>,
    ) -> bool {
        let Some(username) = credential.username.as_deref() else {
            return false;
        };
        let Some(uri) = credential.uri.as_deref() else {
            return false;
        };
        let Some(response) = credential.response.as_deref() else {
            return false;
        };
        if credential.nonce != self.challenge.nonce {
            return false;
        }

        let nc = credential
            .nc
            .as_deref()
            .and_then(|nc| u32::from_str_radix(nc, 16).ok());

        // Recompute with the client's qop choice, not our full offer.
        let effective = DigestChallenge {
            qop: credential.qop.clone(),
            algorithm: credential.algorithm.clone().or(self.challenge.algorithm.clone()),
            ..self.challenge.clone()
        };

        let expected = digest_response(
            &effective,
            username,
            password,
            method,
            uri,
            body,
            credential.cnonce.as_deref(),
            nc.unwrap_or(1),
        );

        if expected != response {
            return false;
        }

        // Replay protection: nc must strictly increase per (cnonce, nonce).
        if let (Some(nc), Some(cnonce), Some(nonce)) =
            (nc, credential.cnonce.clone(), credential.nonce.clone())
        {
            let last = self.seen_nc.entry((cnonce, nonce)).or_insert(0);
            if nc <= *last {
                return false;
            }
            *last = nc;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 2617 section 3.5 example.
    fn rfc2617_challenge() -> DigestChallenge {
        DigestChallenge {
            realm: Some("testrealm@host.com".into()),
            nonce: Some("dcd98b7102dd2f0e8b11d0f600bfb0c093".into()),
            algorithm: Some("MD5".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_rfc2617_vector_no_qop() {
        let response = digest_response(
            &rfc2617_challenge(),
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            None,
            None,
            1,
        );
        assert_eq!(response, "670fd8c2df070c60b045671b8b24ff02");
    }

    #[test]
    fn test_rfc2617_vector_qop_auth() {
        let challenge = DigestChallenge {
            qop: Some("auth,auth-int".into()),
            ..rfc2617_challenge()
        };
        let response = digest_response(
            &challenge,
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            None,
            Some("0a4f113b"),
            1,
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_session_roundtrips_with_verifier() {
        let mut verifier = DigestVerifier::new("x");
        let mut session =
            AuthSession::new(verifier.challenge().clone(), false, "alice", "p");

        let credential = session.credentials("SUBSCRIBE", "sip:bob@s", None);
        assert!(verifier.verify(&credential, "SUBSCRIBE", "p", None));

        // Wrong password must not validate.
        let credential = session.credentials("SUBSCRIBE", "sip:bob@s", None);
        assert!(!verifier.verify(&credential, "SUBSCRIBE", "wrong", None));
    }

    #[test]
    fn test_nc_replay_is_rejected() {
        let mut verifier = DigestVerifier::new("x");
        let challenge = DigestChallenge {
            qop: Some("auth".into()),
            ..verifier.challenge().clone()
        };
        *verifier.challenge_mut() = challenge.clone();

        let mut session = AuthSession::new(challenge, false, "alice", "p");
        let credential = session.credentials("REGISTER", "sip:s", None);

        assert!(verifier.verify(&credential, "REGISTER", "p", None));
        // Same nc replayed.
        assert!(!verifier.verify(&credential, "REGISTER", "p", None));
    }

    #[test]
    fn test_retry_budget() {
        let mut session = AuthSession::new(rfc2617_challenge(), false, "alice", "p");
        assert!(session.take_attempt(3).is_ok());
        assert!(session.take_attempt(3).is_ok());
        assert!(session.take_attempt(3).is_ok());
        assert_matches!(
            session.take_attempt(3),
            Err(Error::AuthenticationFailed(_))
        );
    }

    #[test]
    fn test_md5_sess_uses_cnonce() {
        let challenge = DigestChallenge {
            algorithm: Some("MD5-sess".into()),
            ..rfc2617_challenge()
        };
        let with_cnonce = digest_response(
            &challenge, "u", "p", "GET", "/x", None, Some("abc"), 1,
        );
        let other_cnonce = digest_response(
            &challenge, "u", "p", "GET", "/x", None, Some("def"), 1,
        );
        assert_ne!(with_cnonce, other_cnonce);
    }
}
