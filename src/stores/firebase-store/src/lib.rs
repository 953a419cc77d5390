//! `RequestStore` backed by the Firebase Realtime Database REST interface.

mod stream;

use async_trait::async_trait;
use futures::StreamExt;
use patchlink_core::{
    ProbeRecord, RequestId, RequestStore, SessionId, StoreError, StoreEvent, StoreResult,
    Subscription,
};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use stream::{EventParser, Folded, SubtreeState};
use tokio::sync::mpsc;
use url::Url;

/// Remote path under which session-scoped requests live.
const REQUESTS_PATH: &str = "device_requests";
/// Fixed diagnostic path for connection probes.
const PROBE_PATH: &str = "test";

/// Connect and per-call timeouts. The subscribe stream is long-lived, so
/// only the short-lived calls get an overall deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    /// Base database URL, e.g. `https://example-default-rtdb.firebaseio.com`.
    pub database_url: String,
    /// Optional token sent as the `auth` query parameter on every request.
    pub auth_token: Option<String>,
}

#[derive(Clone)]
pub struct FirebaseStore {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl FirebaseStore {
    pub fn new(config: FirebaseConfig) -> StoreResult<Self> {
        let base_url = Url::parse(&config.database_url).map_err(|error| StoreError::Other {
            message: format!("invalid database_url: {error}"),
        })?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| StoreError::Other {
                message: error.to_string(),
            })?;
        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token,
        })
    }

    /// URL of one node, REST style: path segments joined and suffixed with
    /// `.json`, plus the auth token when configured.
    fn node_url(&self, segments: &[&str]) -> StoreResult<Url> {
        let path = format!("{}.json", segments.join("/"));
        let mut url = self.base_url.join(&path).map_err(|error| StoreError::Other {
            message: format!("invalid node path {path}: {error}"),
        })?;
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }
}

fn network_error(error: reqwest::Error) -> StoreError {
    StoreError::Network {
        message: error.to_string(),
    }
}

fn status_error(status: StatusCode) -> StoreError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Authentication {
            message: format!("store rejected credentials ({status})"),
        },
        other => StoreError::Other {
            message: format!("store returned {other}"),
        },
    }
}

#[async_trait]
impl RequestStore for FirebaseStore {
    fn id(&self) -> &str {
        "firebase"
    }

    async fn subscribe(&self, session: &SessionId) -> StoreResult<Subscription> {
        let url = self.node_url(&[REQUESTS_PATH, session.as_ref()])?;
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(network_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let (tx, rx) = Subscription::channel();
        let producer = tokio::spawn(pump_events(response, tx));
        Ok(Subscription::new(rx, producer))
    }

    async fn delete_request(&self, session: &SessionId, request: &RequestId) -> StoreResult<()> {
        let url = self.node_url(&[REQUESTS_PATH, session.as_ref(), request.as_ref()])?;
        let response = self
            .client
            .delete(url)
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(network_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response.status()))
        }
    }

    async fn write_probe(&self, record: &ProbeRecord) -> StoreResult<()> {
        let url = self.node_url(&[PROBE_PATH])?;
        let response = self
            .client
            .put(url)
            .timeout(CALL_TIMEOUT)
            .json(record)
            .send()
            .await
            .map_err(network_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response.status()))
        }
    }
}

/// Drain the event stream, folding wire events into snapshots for the
/// subscription channel. Ends silently when the stream does; sends `Lost`
/// first when delivery fails.
async fn pump_events(response: Response, tx: mpsc::Sender<StoreEvent>) {
    let mut parser = EventParser::new();
    let mut state = SubtreeState::new();
    let mut bytes = response.bytes_stream();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                let _ = tx.send(StoreEvent::Lost(network_error(error))).await;
                return;
            }
        };
        for event in parser.push(&chunk) {
            match state.apply(&event) {
                Folded::Snapshot(snapshot) => {
                    if tx.send(StoreEvent::Snapshot(snapshot)).await.is_err() {
                        // subscriber hung up
                        return;
                    }
                }
                Folded::Lost(error) => {
                    let _ = tx.send(StoreEvent::Lost(error)).await;
                    return;
                }
                Folded::Ignored => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(token: Option<&str>) -> FirebaseStore {
        FirebaseStore::new(FirebaseConfig {
            database_url: "https://example-default-rtdb.firebaseio.com".into(),
            auth_token: token.map(String::from),
        })
        .unwrap()
    }

    #[test]
    fn node_url_joins_segments() {
        let url = store(None)
            .node_url(&[REQUESTS_PATH, "abc", "req1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example-default-rtdb.firebaseio.com/device_requests/abc/req1.json"
        );
    }

    #[test]
    fn node_url_appends_auth_token() {
        let url = store(Some("secret")).node_url(&[PROBE_PATH]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example-default-rtdb.firebaseio.com/test.json?auth=secret"
        );
    }

    #[test]
    fn invalid_database_url_is_rejected() {
        let result = FirebaseStore::new(FirebaseConfig {
            database_url: "not a url".into(),
            auth_token: None,
        });
        assert!(matches!(result, Err(StoreError::Other { .. })));
    }

    #[test]
    fn auth_statuses_map_to_authentication_errors() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED),
            StoreError::Authentication { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN),
            StoreError::Authentication { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR),
            StoreError::Other { .. }
        ));
    }
}
