//! Zotero Web API (v3) client.
//!
//! Implements [`RemoteLibrary`] over HTTP:
//! - change listing in three phases: collections, items, then deletions
//! - partial updates guarded by `If-Unmodified-Since-Version`
//! - attachment file download
//!
//! Status codes map onto [`RemoteError`]: 412 is a version conflict, 404 a
//! missing object, 429 and 5xx are transient (with `Retry-After`/`Backoff`).

use crate::config::LibraryType;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use z3_core::schema::{fields_to_json, parse_object};
use z3_core::{
    ChangePage, ItemKey, LibraryMetadata, PushReceipt, PushRequest, RemoteEntry, RemoteError,
    RemoteLibrary, SubjectKind,
};

const API_VERSION: &str = "3";

/// Position in the change listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Collections(usize),
    Items(usize),
    Deleted,
}

impl Cursor {
    fn parse(token: &str) -> Result<Self, RemoteError> {
        let invalid = || RemoteError::Protocol(format!("invalid page token: {}", token));
        match token.split_once(':') {
            Some(("collections", start)) => Ok(Cursor::Collections(start.parse().map_err(|_| invalid())?)),
            Some(("items", start)) => Ok(Cursor::Items(start.parse().map_err(|_| invalid())?)),
            None if token == "deleted" => Ok(Cursor::Deleted),
            _ => Err(invalid()),
        }
    }

    /// Same phase, later start.
    fn at(self, start: usize) -> Self {
        match self {
            Cursor::Collections(_) => Cursor::Collections(start),
            Cursor::Items(_) => Cursor::Items(start),
            Cursor::Deleted => Cursor::Deleted,
        }
    }

    /// First page of the following phase.
    fn next_phase(self) -> Option<Self> {
        match self {
            Cursor::Collections(_) => Some(Cursor::Items(0)),
            Cursor::Items(_) => Some(Cursor::Deleted),
            Cursor::Deleted => None,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Collections(start) => write!(f, "collections:{}", start),
            Cursor::Items(start) => write!(f, "items:{}", start),
            Cursor::Deleted => f.write_str("deleted"),
        }
    }
}

/// HTTP client for one Zotero library.
pub struct ZoteroClient {
    /// Library prefix, e.g. `https://api.zotero.org/groups/4711`.
    base_url: String,
    http: reqwest::Client,
    api_key: Option<String>,
    library_type: LibraryType,
    page_size: usize,
}

impl ZoteroClient {
    pub fn new(
        api_url: &str,
        library_type: LibraryType,
        library_id: &str,
        api_key: Option<String>,
        page_size: usize,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .user_agent(concat!("z3sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            base_url: library_url(api_url, library_type, library_id),
            http,
            api_key,
            library_type,
            page_size: page_size.clamp(1, 100),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Zotero-API-Version", API_VERSION);
        match &self.api_key {
            Some(key) => req.header("Zotero-API-Key", key),
            None => req,
        }
    }

    /// Send `req`; non-success statuses become [`RemoteError`]s about `subject`.
    async fn send(&self, req: RequestBuilder, subject: &str) -> Result<Response, RemoteError> {
        let resp = req
            .send()
            .await
            .map_err(|e| RemoteError::transient(format!("request failed: {}", e)))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status, subject, retry_after, &body))
    }

    async fn fetch_listing(
        &self,
        cursor: Cursor,
        kind: SubjectKind,
        since: u64,
        start: usize,
    ) -> Result<ChangePage, RemoteError> {
        let path = kind_path(kind)?;
        let req = self.request(Method::GET, &format!("/{}", path)).query(&[
            ("since", since.to_string()),
            ("start", start.to_string()),
            ("limit", self.page_size.to_string()),
            ("format", "json".to_string()),
        ]);
        let resp = self.send(req, path).await?;
        let version = library_version(resp.headers())?;
        let total = header_u64(resp.headers(), "Total-Results");
        let body = json(resp).await?;
        let entries = parse_listing(&body, kind)?;

        let next = match next_start(start, entries.len(), self.page_size, total) {
            Some(next) => Some(cursor.at(next)),
            None => cursor.next_phase(),
        };
        debug!(%cursor, entries = entries.len(), version, "fetched listing page");
        Ok(ChangePage {
            library_version: version,
            entries,
            next_page: next.map(|c| c.to_string()),
        })
    }
}

#[async_trait]
impl RemoteLibrary for ZoteroClient {
    async fn fetch_changes_page(
        &self,
        since: u64,
        page: Option<&str>,
    ) -> Result<ChangePage, RemoteError> {
        let cursor = match page {
            Some(token) => Cursor::parse(token)?,
            None => Cursor::Collections(0),
        };
        match cursor {
            Cursor::Collections(start) => {
                self.fetch_listing(cursor, SubjectKind::Collection, since, start).await
            }
            Cursor::Items(start) => self.fetch_listing(cursor, SubjectKind::Item, since, start).await,
            Cursor::Deleted => {
                let req = self
                    .request(Method::GET, "/deleted")
                    .query(&[("since", since.to_string())]);
                let resp = self.send(req, "deleted").await?;
                let version = library_version(resp.headers())?;
                let body = json(resp).await?;
                Ok(ChangePage {
                    library_version: version,
                    entries: parse_deleted(&body, version),
                    next_page: None,
                })
            }
        }
    }

    async fn fetch_item(
        &self,
        key: &ItemKey,
        kind: SubjectKind,
    ) -> Result<Option<RemoteEntry>, RemoteError> {
        let path = kind_path(kind)?;
        let req = self.request(Method::GET, &format!("/{}/{}", path, key));
        let resp = match self.send(req, key.as_str()).await {
            Ok(resp) => resp,
            Err(RemoteError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body = json(resp).await?;
        parse_object(&body, kind)
            .map(Some)
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }

    async fn push_item(&self, request: PushRequest) -> Result<PushReceipt, RemoteError> {
        let path = kind_path(request.kind)?;
        let data = fields_to_json(request.kind, &request.fields);
        match request.key {
            None => {
                let req = self
                    .request(Method::POST, &format!("/{}", path))
                    .json(&Value::Array(vec![data]));
                let resp = self.send(req, path).await?;
                let body = json(resp).await?;
                parse_write_response(&body)
            }
            Some(key) => {
                let mut req = self
                    .request(Method::PATCH, &format!("/{}/{}", path, key))
                    .json(&data);
                if let Some(version) = request.expected_version {
                    req = req.header("If-Unmodified-Since-Version", version.to_string());
                }
                let resp = self.send(req, key.as_str()).await?;
                let version = library_version(resp.headers())?;
                Ok(PushReceipt { key, version })
            }
        }
    }

    async fn delete_item(
        &self,
        key: &ItemKey,
        kind: SubjectKind,
        expected_version: u64,
    ) -> Result<u64, RemoteError> {
        let path = kind_path(kind)?;
        let req = self
            .request(Method::DELETE, &format!("/{}/{}", path, key))
            .header("If-Unmodified-Since-Version", expected_version.to_string());
        let resp = self.send(req, key.as_str()).await?;
        library_version(resp.headers())
    }

    async fn fetch_library_metadata(&self) -> Result<Option<LibraryMetadata>, RemoteError> {
        if self.library_type != LibraryType::Group {
            return Ok(None);
        }
        let resp = self.send(self.request(Method::GET, ""), "library").await?;
        let body = json(resp).await?;
        parse_group(&body).map(Some)
    }

    async fn download_file(&self, key: &ItemKey) -> Result<Bytes, RemoteError> {
        let req = self.request(Method::GET, &format!("/items/{}/file", key));
        let resp = self.send(req, key.as_str()).await?;
        resp.bytes()
            .await
            .map_err(|e| RemoteError::transient(format!("download of {} interrupted: {}", key, e)))
    }
}

fn library_url(api_url: &str, library_type: LibraryType, library_id: &str) -> String {
    format!(
        "{}/{}/{}",
        api_url.trim_end_matches('/'),
        library_type.path_segment(),
        library_id
    )
}

fn kind_path(kind: SubjectKind) -> Result<&'static str, RemoteError> {
    match kind {
        SubjectKind::Item => Ok("items"),
        SubjectKind::Collection => Ok("collections"),
        SubjectKind::Library => Err(RemoteError::Protocol(
            "library metadata is read-only".to_string(),
        )),
    }
}

async fn json(resp: Response) -> Result<Value, RemoteError> {
    resp.json()
        .await
        .map_err(|e| RemoteError::Protocol(format!("invalid JSON response: {}", e)))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

fn library_version(headers: &HeaderMap) -> Result<u64, RemoteError> {
    header_u64(headers, "Last-Modified-Version")
        .ok_or_else(|| RemoteError::Protocol("missing Last-Modified-Version header".to_string()))
}

/// Server-requested delay, from `Retry-After` or Zotero's `Backoff`.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_u64(headers, "Retry-After")
        .or_else(|| header_u64(headers, "Backoff"))
        .map(Duration::from_secs)
}

fn status_error(
    status: StatusCode,
    subject: &str,
    retry_after: Option<Duration>,
    body: &str,
) -> RemoteError {
    match status.as_u16() {
        412 => RemoteError::Conflict {
            key: subject.to_string(),
        },
        404 => RemoteError::NotFound(subject.to_string()),
        401 | 403 => RemoteError::Unauthorized(format!("{} {}", status, body.trim())),
        429 | 500..=599 => RemoteError::Transient {
            message: format!("{} {}", status, body.trim()),
            retry_after,
        },
        _ => RemoteError::Protocol(format!("unexpected status {}: {}", status, body.trim())),
    }
}

/// Start of the next page, if the current phase has more.
fn next_start(start: usize, received: usize, limit: usize, total: Option<u64>) -> Option<usize> {
    if received == 0 {
        return None;
    }
    let next = start + received;
    match total {
        Some(total) => ((next as u64) < total).then_some(next),
        None => (received >= limit).then_some(next),
    }
}

fn parse_listing(body: &Value, kind: SubjectKind) -> Result<Vec<RemoteEntry>, RemoteError> {
    let objects = body
        .as_array()
        .ok_or_else(|| RemoteError::Protocol("listing is not a JSON array".to_string()))?;
    objects
        .iter()
        .map(|o| parse_object(o, kind).map_err(|e| RemoteError::Protocol(e.to_string())))
        .collect()
}

/// Tombstones from a `/deleted` response, all at the listing version.
fn parse_deleted(body: &Value, version: u64) -> Vec<RemoteEntry> {
    [("collections", SubjectKind::Collection), ("items", SubjectKind::Item)]
        .into_iter()
        .flat_map(|(member, kind)| {
            body.get(member)
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(move |key| RemoteEntry::tombstone(ItemKey::new(key), kind, version))
        })
        .collect()
}

/// Key and version of the single object created by a POST.
fn parse_write_response(body: &Value) -> Result<PushReceipt, RemoteError> {
    if let Some(created) = body.pointer("/successful/0") {
        let key = created
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Protocol("created object has no key".to_string()))?;
        let version = created
            .get("version")
            .or_else(|| created.pointer("/data/version"))
            .and_then(Value::as_u64)
            .ok_or_else(|| RemoteError::Protocol("created object has no version".to_string()))?;
        return Ok(PushReceipt {
            key: ItemKey::new(key),
            version,
        });
    }
    if let Some(failed) = body.pointer("/failed/0") {
        let message = failed
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let key = failed.get("key").and_then(Value::as_str).unwrap_or("");
        return Err(match failed.get("code").and_then(Value::as_u64) {
            Some(412) => RemoteError::Conflict {
                key: key.to_string(),
            },
            Some(code) if code == 429 || code >= 500 => RemoteError::transient(message),
            _ => RemoteError::Protocol(format!("write rejected: {}", message)),
        });
    }
    Err(RemoteError::Protocol(
        "write response reports neither success nor failure".to_string(),
    ))
}

fn parse_group(body: &Value) -> Result<LibraryMetadata, RemoteError> {
    let data = body.get("data").unwrap_or(body);
    let text = |name: &str| {
        data.get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let id = body
        .get("id")
        .or_else(|| data.get("id"))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .ok_or_else(|| RemoteError::Protocol("group response has no id".to_string()))?;
    Ok(LibraryMetadata {
        id,
        name: text("name"),
        description: text("description"),
        url: text("url"),
        version: body
            .get("version")
            .or_else(|| data.get("version"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use z3_core::RemoteChange;

    #[test]
    fn test_cursor_tokens() {
        for cursor in [Cursor::Collections(0), Cursor::Items(200), Cursor::Deleted] {
            assert_eq!(Cursor::parse(&cursor.to_string()).unwrap(), cursor);
        }
        assert!(Cursor::parse("items:x").is_err());
        assert!(Cursor::parse("searches:0").is_err());
        assert_eq!(Cursor::Collections(100).next_phase(), Some(Cursor::Items(0)));
        assert_eq!(Cursor::Deleted.next_phase(), None);
    }

    #[test]
    fn test_next_start() {
        assert_eq!(next_start(0, 100, 100, Some(250)), Some(100));
        assert_eq!(next_start(200, 50, 100, Some(250)), None);
        assert_eq!(next_start(0, 0, 100, Some(250)), None);
        assert_eq!(next_start(0, 100, 100, None), Some(100));
        assert_eq!(next_start(100, 7, 100, None), None);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::PRECONDITION_FAILED, "ABCD2345", None, ""),
            RemoteError::Conflict { key } if key == "ABCD2345"
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "ABCD2345", None, "Not found"),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "items", None, "Invalid key"),
            RemoteError::Unauthorized(_)
        ));
        let busy = status_error(
            StatusCode::TOO_MANY_REQUESTS,
            "items",
            Some(Duration::from_secs(5)),
            "",
        );
        assert!(busy.is_transient());
        assert_eq!(busy.retry_after(), Some(Duration::from_secs(5)));
        assert!(status_error(StatusCode::BAD_GATEWAY, "items", None, "").is_transient());
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "items", None, "bad"),
            RemoteError::Protocol(_)
        ));
    }

    #[test]
    fn test_retry_after_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert("Backoff", HeaderValue::from_static("30"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(30)));
        headers.insert("Retry-After", HeaderValue::from_static("4"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(4)));

        headers.insert("Last-Modified-Version", HeaderValue::from_static("1234"));
        assert_eq!(library_version(&headers).unwrap(), 1234);
        assert!(library_version(&HeaderMap::new()).is_err());
    }

    #[test]
    fn test_parse_write_response() {
        let ok = json!({
            "successful": { "0": { "key": "SRVK2345", "version": 88, "data": { "version": 88 } } },
            "success": { "0": "SRVK2345" },
            "unchanged": {},
            "failed": {}
        });
        assert_eq!(
            parse_write_response(&ok).unwrap(),
            PushReceipt {
                key: ItemKey::new("SRVK2345"),
                version: 88
            }
        );

        let conflict = json!({ "successful": {}, "failed": { "0": { "key": "ABCD2345", "code": 412, "message": "Item has been modified" } } });
        assert!(parse_write_response(&conflict).unwrap_err().is_conflict());

        let invalid = json!({ "successful": {}, "failed": { "0": { "code": 400, "message": "'itemType' property not provided" } } });
        assert!(matches!(
            parse_write_response(&invalid),
            Err(RemoteError::Protocol(m)) if m.contains("itemType")
        ));
        assert!(parse_write_response(&json!({})).is_err());
    }

    #[test]
    fn test_parse_deleted() {
        let body = json!({
            "collections": ["COLL2345"],
            "items": ["ITEM2345", "NOTE2345"],
            "searches": ["SRCH2345"],
            "tags": ["old"]
        });
        let entries = parse_deleted(&body, 91);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, SubjectKind::Collection);
        assert!(entries.iter().all(|e| e.is_tombstone() && e.version == 91));
    }

    #[test]
    fn test_parse_listing() {
        let body = json!([
            { "key": "COLL2345", "version": 4, "data": { "key": "COLL2345", "version": 4, "name": "Maps", "parentCollection": false } }
        ]);
        let entries = parse_listing(&body, SubjectKind::Collection).unwrap();
        assert_eq!(entries.len(), 1);
        let RemoteChange::Fields(fields) = &entries[0].change else {
            panic!("expected fields");
        };
        assert_eq!(fields.to_fields().first_text("name"), Some("Maps"));
        assert!(parse_listing(&json!({ "key": "x" }), SubjectKind::Item).is_err());
    }

    #[test]
    fn test_parse_group() {
        let body = json!({
            "id": 4711,
            "version": 12,
            "data": { "id": 4711, "name": "Cartography", "description": "<p>Maps</p>", "url": "" }
        });
        let meta = parse_group(&body).unwrap();
        assert_eq!(meta.id, "4711");
        assert_eq!(meta.name, "Cartography");
        assert_eq!(meta.version, 12);
        assert_eq!(meta.url, "");
    }

    #[test]
    fn test_library_url() {
        assert_eq!(
            library_url("https://api.zotero.org/", LibraryType::Group, "4711"),
            "https://api.zotero.org/groups/4711"
        );
        assert_eq!(
            library_url("http://localhost:8080", LibraryType::User, "1"),
            "http://localhost:8080/users/1"
        );
    }
}
