use std::fmt;

use base64::Engine;
use reqwest::Url;

/// Replacement for secrets in log output.
const REDACTED: &str = "*****";

/// Username git hosts accept alongside a bare token.
const TOKEN_USER: &str = "x-access-token";

/// Username/password pair taken from a client's `Authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse an `Authorization` header value.
    ///
    /// `Basic` headers are base64-decoded into `user:password`.  `Bearer` and
    /// `token` headers become an `x-access-token` user with the token as the
    /// password.  Anything else yields `None`.
    pub fn from_authorization(header: &str) -> Option<Self> {
        let (scheme, value) = header.trim().split_once(' ')?;
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(value)
                .ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (user, pass) = decoded.split_once(':')?;
            Some(Self::new(user, pass))
        } else if scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token") {
            Some(Self::new(TOKEN_USER, value))
        } else {
            None
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Return `url` with these credentials as its userinfo.
    ///
    /// Only http(s) URLs carry credentials; other schemes are returned as is.
    pub fn authenticated_url(&self, url: &Url) -> Url {
        let mut url = url.clone();
        if matches!(url.scheme(), "http" | "https") {
            // Both setters only fail for cannot-be-a-base URLs, which http(s)
            // URLs never are.
            let _ = url.set_username(&self.username);
            let _ = url.set_password(Some(&self.password));
        }
        url
    }
}

/// Redact the password of a URL for logging.
pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some(REDACTED));
            parsed.to_string()
        }
        Ok(_) => url.to_string(),
        Err(_) => redact_text(url),
    }
}

/// Redact every `scheme://user:password@` occurrence in free text, such as
/// git's stderr.
pub fn redact_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(idx) = rest.find("://") {
        let (head, tail) = rest.split_at(idx + 3);
        out.push_str(head);

        let authority_end = tail
            .find(|c: char| c == '/' || c == '?' || c == '#' || c.is_whitespace() || c == '\'')
            .unwrap_or(tail.len());
        let authority = &tail[..authority_end];

        match authority.rfind('@') {
            Some(at) => {
                let userinfo = &authority[..at];
                match userinfo.split_once(':') {
                    Some((user, _)) => {
                        out.push_str(user);
                        out.push(':');
                        out.push_str(REDACTED);
                    }
                    None => out.push_str(userinfo),
                }
                out.push_str(&authority[at..]);
            }
            None => out.push_str(authority),
        }
        rest = &tail[authority_end..];
    }

    out.push_str(rest);
    out
}
