//! Challenge and credential types for HTTP Digest authentication
//! (RFC 2617), as carried by the `WWW-Authenticate`, `Proxy-Authenticate`,
//! `Authorization` and `Proxy-Authorization` headers.

use std::fmt;

use asip_util::{ArcStr, Scanner};

use super::Params;
use crate::error::{Result, SipParserError};

const DIGEST_SCHEME: &str = "Digest";

/// A server-issued Digest challenge.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct DigestChallenge {
    /// The protection space.
    pub realm: Option<ArcStr>,
    /// The domain of the challenge.
    pub domain: Option<ArcStr>,
    /// The server nonce.
    pub nonce: Option<ArcStr>,
    /// Opaque value to be returned unchanged.
    pub opaque: Option<ArcStr>,
    /// Whether the previous request used a stale nonce.
    pub stale: Option<ArcStr>,
    /// The hash algorithm (`MD5` or `MD5-sess`).
    pub algorithm: Option<ArcStr>,
    /// The quality of protection offer (`auth`, `auth-int`, or a list).
    pub qop: Option<ArcStr>,
}

impl DigestChallenge {
    /// Creates a plain MD5 challenge for `realm` with the given nonce.
    pub fn new(realm: &str, nonce: &str) -> Self {
        DigestChallenge {
            realm: Some(realm.into()),
            nonce: Some(nonce.into()),
            algorithm: Some("MD5".into()),
            ..Default::default()
        }
    }
}

/// An authentication challenge, as found in `WWW-Authenticate` and
/// `Proxy-Authenticate` headers.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Challenge {
    /// A `Digest` challenge.
    Digest(DigestChallenge),
    /// Any other scheme, kept verbatim.
    Other {
        /// The scheme name.
        scheme: ArcStr,
        /// The scheme parameters.
        param: Params,
    },
}

impl Challenge {
    /// Returns the digest challenge, if this is one.
    pub fn digest(&self) -> Option<&DigestChallenge> {
        match self {
            Challenge::Digest(digest) => Some(digest),
            Challenge::Other { .. } => None,
        }
    }

    /// Parses a challenge value (`Digest realm="...", nonce="..."`).
    pub fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let (scheme, params) = parse_auth_value(scanner)?;

        if !scheme.eq_ignore_ascii_case(DIGEST_SCHEME) {
            let mut param = Params::new();
            for (name, value) in params {
                param.set(&name, Some(&value));
            }
            return Ok(Challenge::Other {
                scheme: scheme.into(),
                param,
            });
        }

        let mut digest = DigestChallenge::default();
        for (name, value) in params {
            let value = ArcStr::from(value);
            match name.to_ascii_lowercase().as_str() {
                "realm" => digest.realm = Some(value),
                "domain" => digest.domain = Some(value),
                "nonce" => digest.nonce = Some(value),
                "opaque" => digest.opaque = Some(value),
                "stale" => digest.stale = Some(value),
                "algorithm" => digest.algorithm = Some(value),
                "qop" => digest.qop = Some(value),
                _ => (),
            }
        }

        Ok(Challenge::Digest(digest))
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Challenge::Digest(DigestChallenge {
                realm,
                domain,
                nonce,
                opaque,
                stale,
                algorithm,
                qop,
            }) => {
                write!(f, "{} ", DIGEST_SCHEME)?;
                let mut sep = "";
                if let Some(realm) = realm {
                    write!(f, "{}realm=\"{}\"", sep, realm)?;
                    sep = ", ";
                }
                if let Some(domain) = domain {
                    write!(f, "{}domain=\"{}\"", sep, domain)?;
                    sep = ", ";
                }
                if let Some(nonce) = nonce {
                    write!(f, "{}nonce=\"{}\"", sep, nonce)?;
                    sep = ", ";
                }
                if let Some(opaque) = opaque {
                    write!(f, "{}opaque=\"{}\"", sep, opaque)?;
                    sep = ", ";
                }
                if let Some(stale) = stale {
                    write!(f, "{}stale={}", sep, stale)?;
                    sep = ", ";
                }
                if let Some(algorithm) = algorithm {
                    write!(f, "{}algorithm={}", sep, algorithm)?;
                    sep = ", ";
                }
                if let Some(qop) = qop {
                    write!(f, "{}qop=\"{}\"", sep, qop)?;
                }
                Ok(())
            }
            Challenge::Other { scheme, param } => {
                write!(f, "{}", scheme)?;
                let mut sep = " ";
                for p in param.iter() {
                    match &p.value {
                        Some(value) => write!(f, "{}{}={}", sep, p.name, value)?,
                        None => write!(f, "{}{}", sep, p.name)?,
                    }
                    sep = ", ";
                }
                Ok(())
            }
        }
    }
}

/// Client-supplied Digest credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DigestCredential {
    /// The username in the given realm.
    pub username: Option<ArcStr>,
    /// The protection space.
    pub realm: Option<ArcStr>,
    /// The server nonce being answered.
    pub nonce: Option<ArcStr>,
    /// The digest URI.
    pub uri: Option<ArcStr>,
    /// The computed response hash.
    pub response: Option<ArcStr>,
    /// The hash algorithm.
    pub algorithm: Option<ArcStr>,
    /// The client nonce.
    pub cnonce: Option<ArcStr>,
    /// Opaque value returned unchanged.
    pub opaque: Option<ArcStr>,
    /// The selected quality of protection.
    pub qop: Option<ArcStr>,
    /// The nonce count, 8 hex digits.
    pub nc: Option<ArcStr>,
}

/// Credentials carried in `Authorization` and `Proxy-Authorization`
/// headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// A `Digest` credential.
    Digest(DigestCredential),
    /// Any other scheme, kept verbatim.
    Other {
        /// The scheme name.
        scheme: ArcStr,
        /// The scheme parameters.
        param: Params,
    },
}

impl Credential {
    /// Returns the digest credential, if this is one.
    pub fn digest(&self) -> Option<&DigestCredential> {
        match self {
            Credential::Digest(digest) => Some(digest),
            Credential::Other { .. } => None,
        }
    }

    /// Parses a credential value (`Digest username="...", ...`).
    pub fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let (scheme, params) = parse_auth_value(scanner)?;

        if !scheme.eq_ignore_ascii_case(DIGEST_SCHEME) {
            let mut param = Params::new();
            for (name, value) in params {
                param.set(&name, Some(&value));
            }
            return Ok(Credential::Other {
                scheme: scheme.into(),
                param,
            });
        }

        let mut digest = DigestCredential::default();
        for (name, value) in params {
            let value = ArcStr::from(value);
            match name.to_ascii_lowercase().as_str() {
                "username" => digest.username = Some(value),
                "realm" => digest.realm = Some(value),
                "nonce" => digest.nonce = Some(value),
                "uri" => digest.uri = Some(value),
                "response" => digest.response = Some(value),
                "algorithm" => digest.algorithm = Some(value),
                "cnonce" => digest.cnonce = Some(value),
                "opaque" => digest.opaque = Some(value),
                "qop" => digest.qop = Some(value),
                "nc" => digest.nc = Some(value),
                _ => (),
            }
        }

        Ok(Credential::Digest(digest))
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Digest(DigestCredential {
                username,
                realm,
                nonce,
                uri,
                response,
                algorithm,
                cnonce,
                opaque,
                qop,
                nc,
            }) => {
                write!(f, "{} ", DIGEST_SCHEME)?;
                let mut sep = "";
                if let Some(username) = username {
                    write!(f, "{}username=\"{}\"", sep, username)?;
                    sep = ", ";
                }
                if let Some(realm) = realm {
                    write!(f, "{}realm=\"{}\"", sep, realm)?;
                    sep = ", ";
                }
                if let Some(nonce) = nonce {
                    write!(f, "{}nonce=\"{}\"", sep, nonce)?;
                    sep = ", ";
                }
                if let Some(uri) = uri {
                    write!(f, "{}uri=\"{}\"", sep, uri)?;
                    sep = ", ";
                }
                if let Some(response) = response {
                    write!(f, "{}response=\"{}\"", sep, response)?;
                    sep = ", ";
                }
                if let Some(algorithm) = algorithm {
                    write!(f, "{}algorithm={}", sep, algorithm)?;
                    sep = ", ";
                }
                if let Some(cnonce) = cnonce {
                    write!(f, "{}cnonce=\"{}\"", sep, cnonce)?;
                    sep = ", ";
                }
                if let Some(qop) = qop {
                    write!(f, "{}qop={}", sep, qop)?;
                    sep = ", ";
                }
                if let Some(nc) = nc {
                    write!(f, "{}nc={}", sep, nc)?;
                    sep = ", ";
                }
                if let Some(opaque) = opaque {
                    write!(f, "{}opaque=\"{}\"", sep, opaque)?;
                }
                Ok(())
            }
            Credential::Other { scheme, param } => {
                write!(f, "{}", scheme)?;
                let mut sep = " ";
                for p in param.iter() {
                    match &p.value {
                        Some(value) => write!(f, "{}{}={}", sep, p.name, value)?,
                        None => write!(f, "{}{}", sep, p.name)?,
                    }
                    sep = ", ";
                }
                Ok(())
            }
        }
    }
}

/// Parses `Scheme name=value, name="value", ...` into the scheme token
/// and its parameter list. Quotes are stripped from quoted values.
fn parse_auth_value(scanner: &mut Scanner<'_>) -> Result<(String, Vec<(String, String)>)> {
    scanner.skip_ws();
    let scheme = scanner.read_until_any(b" \t\r\n");
    if scheme.is_empty() {
        return Err(SipParserError::new("empty auth scheme").into());
    }
    let scheme = std::str::from_utf8(scheme)?.to_string();

    let mut params = Vec::new();
    loop {
        scanner.skip_ws();
        let name = scanner.read_until_any(b"=,\r\n");
        let name = std::str::from_utf8(name)?.trim();
        if name.is_empty() {
            match scanner.peek() {
                Some(b',') => {
                    scanner.bump();
                    continue;
                }
                _ => break,
            }
        }

        if scanner.peek() != Some(b'=') {
            break;
        }
        scanner.bump();

        let value = if scanner.peek() == Some(b'"') {
            scanner.bump();
            let value = scanner.read_until(b'"');
            let value = std::str::from_utf8(value)?;
            scanner.expect(b'"')?;
            value.to_string()
        } else {
            std::str::from_utf8(scanner.read_until_any(b",\r\n"))?
                .trim()
                .to_string()
        };

        params.push((name.to_string(), value));

        if scanner.peek() == Some(b',') {
            scanner.bump();
        } else {
            break;
        }
    }

    Ok((scheme, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let src = b"Digest realm=\"atlanta.com\", nonce=\"84a4cc6f3082121f32b42a2187831a9e\", algorithm=MD5, qop=\"auth\"";
        let challenge = Challenge::parse(&mut Scanner::new(src)).unwrap();

        let digest = challenge.digest().unwrap();
        assert_eq!(digest.realm.as_ref().unwrap(), "atlanta.com");
        assert_eq!(
            digest.nonce.as_ref().unwrap(),
            "84a4cc6f3082121f32b42a2187831a9e"
        );
        assert_eq!(digest.algorithm.as_ref().unwrap(), "MD5");
        assert_eq!(digest.qop.as_ref().unwrap(), "auth");
    }

    #[test]
    fn test_parse_credential() {
        let src = b"Digest username=\"alice\", realm=\"atlanta.com\", nonce=\"N\", uri=\"sip:bob@s\", response=\"abc\", cnonce=\"xyz\", qop=auth, nc=00000001";
        let credential = Credential::parse(&mut Scanner::new(src)).unwrap();

        let digest = credential.digest().unwrap();
        assert_eq!(digest.username.as_ref().unwrap(), "alice");
        assert_eq!(digest.uri.as_ref().unwrap(), "sip:bob@s");
        assert_eq!(digest.nc.as_ref().unwrap(), "00000001");
        assert_eq!(digest.qop.as_ref().unwrap(), "auth");
    }

    #[test]
    fn test_challenge_display_roundtrip() {
        let challenge = Challenge::Digest(DigestChallenge::new("x", "N"));
        let rendered = challenge.to_string();
        assert_eq!(rendered, "Digest realm=\"x\", nonce=\"N\", algorithm=MD5");

        let reparsed = Challenge::parse(&mut Scanner::new(rendered.as_bytes())).unwrap();
        assert_eq!(reparsed, challenge);
    }
}
