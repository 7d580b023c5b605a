//! GitHub user lookups over [HttpClient].
//!
//! The client is passed in explicitly; construct it once at startup and share
//! clones of the [GitHubApi].
use std::fmt::Write;

use serde::{Deserialize, Deserializer};

use crate::{
    error::Result,
    http::{HttpCall, HttpClient},
    task::AsyncScope,
};

/// Plain-HTTP endpoint of the public API.
pub const DEFAULT_BASE_URL: &str = "http://api.github.com";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub name: Option<String>,
    pub url: String,
}

// The API sends a number, but ids are opaque to us.
fn id_as_string<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }

    Ok(match Id::deserialize(de)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());

    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }

    out
}

#[derive(Debug, Clone)]
pub struct GitHubApi {
    client: HttpClient,
}

impl GitHubApi {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    /// `GET /users/{login}` as a callback-style call.
    pub fn get_user_callback(&self, login: &str) -> HttpCall<User> {
        self.client.get(&format!("/users/{}", encode_segment(login)))
    }

    /// `GET /users/{login}`, suspending the calling computation.
    pub async fn get_user(&self, scope: &AsyncScope, login: &str) -> Result<User> {
        scope.await_call(|| self.get_user_callback(login)).await
    }
}
