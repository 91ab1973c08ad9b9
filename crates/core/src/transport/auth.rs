//! RTSP challenge-response authentication (RFC 2617 over RFC 2326 §12.56).
//!
//! A 401 response carries a `WWW-Authenticate` challenge; the connection
//! parses it into a [`Challenge`] and answers every subsequent request with
//! an `Authorization` header. Basic and Digest (MD5, with and without
//! `qop=auth`) are supported, which covers what RTSP cameras deploy.

use std::collections::HashMap;

use base64::Engine;
use md5::{Digest, Md5};
use rand::RngExt;

use crate::error::{ProbeError, Result};

/// Authentication scheme announced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Basic,
    Digest,
}

/// Parsed `WWW-Authenticate` challenge state, kept for the lifetime of the
/// connection (the server's nonce stays valid across requests).
#[derive(Debug, Clone)]
pub struct Challenge {
    pub scheme: Scheme,
    pub realm: String,
    nonce: String,
    opaque: Option<String>,
    qop_auth: bool,
    /// Nonce-use counter for `qop=auth` responses.
    nc: u32,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Result<Self> {
        let (scheme, params) = if let Some(rest) = header.strip_prefix("Basic ") {
            (Scheme::Basic, rest)
        } else if let Some(rest) = header.strip_prefix("Digest ") {
            (Scheme::Digest, rest)
        } else {
            return Err(ProbeError::Auth {
                reason: format!("unsupported authentication scheme: {}", header),
            });
        };

        let params = parse_params(params);
        let realm = params.get("realm").cloned().unwrap_or_default();
        let nonce = params.get("nonce").cloned().unwrap_or_default();

        if scheme == Scheme::Digest && nonce.is_empty() {
            return Err(ProbeError::Auth {
                reason: "digest challenge missing nonce".to_string(),
            });
        }

        Ok(Challenge {
            scheme,
            realm,
            nonce,
            opaque: params.get("opaque").cloned(),
            qop_auth: params
                .get("qop")
                .is_some_and(|qop| qop.split(',').any(|q| q.trim() == "auth")),
            nc: 0,
        })
    }

    /// Build the `Authorization` header value for one request.
    pub fn authorization(
        &mut self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> String {
        match self.scheme {
            Scheme::Basic => {
                let credentials = format!("{}:{}", username, password);
                format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes())
                )
            }
            Scheme::Digest => self.digest_authorization(username, password, method, uri),
        }
    }

    fn digest_authorization(
        &mut self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> String {
        let mut header;
        if self.qop_auth {
            self.nc += 1;
            let nc = format!("{:08x}", self.nc);
            let cnonce = format!("{:016x}", rand::rng().random::<u64>());
            let response = digest_response(
                username,
                &self.realm,
                password,
                method,
                uri,
                &self.nonce,
                Some((&nc, &cnonce)),
            );
            header = format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5, nc={}, cnonce="{}", qop=auth"#,
                username, self.realm, self.nonce, uri, response, nc, cnonce
            );
        } else {
            let response = digest_response(
                username,
                &self.realm,
                password,
                method,
                uri,
                &self.nonce,
                None,
            );
            header = format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
                username, self.realm, self.nonce, uri, response
            );
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        header
    }
}

/// MD5 digest response per RFC 2617 §3.2.2.
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop_auth: Option<(&str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop_auth {
        Some((nc, cnonce)) => md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, nonce, nc, cnonce, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Split the comma-separated challenge parameters, respecting quotes.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                insert_param(&mut params, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    insert_param(&mut params, &current);
    params
}

fn insert_param(params: &mut HashMap<String, String>, raw: &str) {
    let raw = raw.trim();
    let Some(eq) = raw.find('=') else { return };
    let key = raw[..eq].trim().to_ascii_lowercase();
    let value = raw[eq + 1..].trim().trim_matches('"').to_string();
    params.insert(key, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_authorization_encoding() {
        let mut challenge = Challenge::parse(r#"Basic realm="cam""#).unwrap();
        assert_eq!(challenge.scheme, Scheme::Basic);
        assert_eq!(
            challenge.authorization("user", "pass", "DESCRIBE", "rtsp://x/"),
            "Basic dXNlcjpwYXNz"
        );
    }

    #[test]
    fn digest_challenge_fields() {
        let challenge = Challenge::parse(
            r#"Digest realm="IP Camera", nonce="abc123", opaque="xyz", qop="auth, auth-int""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, Scheme::Digest);
        assert_eq!(challenge.realm, "IP Camera");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert!(challenge.qop_auth);
    }

    #[test]
    fn digest_without_nonce_rejected() {
        assert!(Challenge::parse(r#"Digest realm="cam""#).is_err());
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(Challenge::parse("Bearer token").is_err());
    }

    // RFC 2617 §3.5 example values.
    #[test]
    fn digest_response_rfc2617_vector() {
        let response = digest_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some(("00000001", "0a4f113b")),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn digest_authorization_without_qop() {
        let mut challenge =
            Challenge::parse(r#"Digest realm="cam", nonce="n1""#).unwrap();
        let header = challenge.authorization("u", "p", "SETUP", "rtsp://cam/track1");
        assert!(header.starts_with("Digest username=\"u\""));
        assert!(header.contains(r#"nonce="n1""#));
        assert!(header.contains(r#"uri="rtsp://cam/track1""#));
        assert!(!header.contains("qop="));
    }

    #[test]
    fn nonce_count_increments_per_request() {
        let mut challenge =
            Challenge::parse(r#"Digest realm="cam", nonce="n1", qop="auth""#).unwrap();
        let first = challenge.authorization("u", "p", "PLAY", "rtsp://cam/");
        let second = challenge.authorization("u", "p", "PLAY", "rtsp://cam/");
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }
}
