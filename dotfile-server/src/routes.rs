//! Request routing and response helpers

use bytes::Bytes;
use dotfile_core::Fingerprint;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use std::collections::HashMap;

/// A resolved endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Signup,
    Owner { owner: String },
    File { owner: String, alias: String },
    Commits { owner: String, alias: String },
    Revision { owner: String, alias: String, hash: Fingerprint },
    Checkout { owner: String, alias: String, hash: Fingerprint },
}

/// Why a request did not resolve to a [`Route`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    NotFound,
    MethodNotAllowed,
    BadHash(String),
}

fn parse_hash(hash: &str) -> Result<Fingerprint, RouteError> {
    hash.parse().map_err(|_| RouteError::BadHash(hash.to_string()))
}

/// Match a method and decoded path against the endpoint table
///
/// `reserved` names can never be an owner segment.
pub fn resolve(method: &Method, path: &str, reserved: &[&str]) -> Result<Route, RouteError> {
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(urldecode)
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    let route = match segments.as_slice() {
        ["signup"] => Route::Signup,
        [owner, ..] if reserved.contains(owner) => return Err(RouteError::NotFound),
        [owner] => Route::Owner { owner: owner.to_string() },
        [owner, alias] => Route::File {
            owner: owner.to_string(),
            alias: alias.to_string(),
        },
        [owner, alias, "commits"] => Route::Commits {
            owner: owner.to_string(),
            alias: alias.to_string(),
        },
        [owner, alias, hash] => Route::Revision {
            owner: owner.to_string(),
            alias: alias.to_string(),
            hash: parse_hash(hash)?,
        },
        [owner, alias, hash, "checkout"] => Route::Checkout {
            owner: owner.to_string(),
            alias: alias.to_string(),
            hash: parse_hash(hash)?,
        },
        _ => return Err(RouteError::NotFound),
    };

    let allowed = match route {
        Route::Signup | Route::Checkout { .. } => *method == Method::POST,
        Route::Owner { .. } | Route::Commits { .. } | Route::Revision { .. } => {
            *method == Method::GET
        }
        Route::File { .. } => matches!(*method, Method::GET | Method::PUT | Method::DELETE),
    };
    if !allowed {
        return Err(RouteError::MethodNotAllowed);
    }
    Ok(route)
}

/// Parse a query string into decoded key/value pairs
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (urldecode(k), urldecode(v)),
            None => (urldecode(pair), String::new()),
        })
        .collect()
}

/// Percent-decode one URL component; invalid UTF-8 is replaced
pub fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                match (hex_val(bytes.get(i + 1).copied()), hex_val(bytes.get(i + 2).copied())) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<u8>) -> Option<u8> {
    match b? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

pub fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

pub fn json<T: serde::Serialize>(status: StatusCode, data: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(data) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

pub fn json_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    respond(status, "application/json", body)
}

pub fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESERVED: &[&str] = &["about", "signup"];

    #[test]
    fn test_resolve_routes() {
        let hash = Fingerprint::of(b"x");
        assert_eq!(resolve(&Method::POST, "/signup", RESERVED), Ok(Route::Signup));
        assert_eq!(
            resolve(&Method::GET, "/alice", RESERVED),
            Ok(Route::Owner { owner: "alice".into() })
        );
        assert_eq!(
            resolve(&Method::PUT, "/alice/bashrc/", RESERVED),
            Ok(Route::File {
                owner: "alice".into(),
                alias: "bashrc".into()
            })
        );
        assert_eq!(
            resolve(&Method::GET, "/alice/bashrc/commits", RESERVED),
            Ok(Route::Commits {
                owner: "alice".into(),
                alias: "bashrc".into()
            })
        );
        assert_eq!(
            resolve(&Method::POST, &format!("/alice/bashrc/{}/checkout", hash), RESERVED),
            Ok(Route::Checkout {
                owner: "alice".into(),
                alias: "bashrc".into(),
                hash
            })
        );
    }

    #[test]
    fn test_resolve_rejections() {
        assert_eq!(resolve(&Method::GET, "/about", RESERVED), Err(RouteError::NotFound));
        assert_eq!(resolve(&Method::GET, "/", RESERVED), Err(RouteError::NotFound));
        assert_eq!(resolve(&Method::POST, "/alice", RESERVED), Err(RouteError::MethodNotAllowed));
        assert_eq!(
            resolve(&Method::GET, "/alice/bashrc/nothex", RESERVED),
            Err(RouteError::BadHash("nothex".into()))
        );
    }

    #[test]
    fn test_urldecode() {
        assert_eq!(urldecode("hello%20world"), "hello world");
        assert_eq!(urldecode("init.lua"), "init.lua");
        assert_eq!(urldecode("%E2%9C%93"), "\u{2713}");
        assert_eq!(urldecode("100%"), "100%");
        assert_eq!(urldecode("%zz"), "%zz");
    }

    #[test]
    fn test_parse_query() {
        let query = parse_query("format=json&flag");
        assert_eq!(query.get("format").map(String::as_str), Some("json"));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
    }
}
