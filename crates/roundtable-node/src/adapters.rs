//! Agent adapters: the capability to hand a prompt to one chat site and read
//! back its latest reply.
//!
//! The node reaches chat sites through an [`EndpointHost`], which enumerates
//! reachable endpoints and carries one request/response exchange per call.
//! [`SocketEndpointHost`] is the concrete host: a directory of Unix sockets,
//! one endpoint process per socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use roundtable::adapter_protocol::{AdapterRequest, AdapterResponse};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

const MAX_ENDPOINT_LINE: usize = 1024 * 1024;

/// Fixed prompt sent by the roll-call command.
pub const ROLL_CALL_PROMPT: &str =
    "Please state your name and your core capabilities briefly for the roundtable record.";

/// A known chat site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentProfile {
    /// Stable key used as the entry kind of this agent's replies.
    pub key: &'static str,
    /// Display name, used as the sender of harvested replies.
    pub name: &'static str,
    /// Host name identifying the site in an endpoint URL.
    pub host: &'static str,
}

pub const CATALOGUE: [AgentProfile; 4] = [
    AgentProfile {
        key: "gemini",
        name: "Gemini",
        host: "gemini.google.com",
    },
    AgentProfile {
        key: "claude",
        name: "Claude",
        host: "claude.ai",
    },
    AgentProfile {
        key: "gpt",
        name: "ChatGPT",
        host: "chatgpt.com",
    },
    AgentProfile {
        key: "aistudio",
        name: "AI Studio",
        host: "aistudio.google.com",
    },
];

/// Match an endpoint URL against the catalogue by its host.
pub fn match_profile(url: &str) -> Option<&'static AgentProfile> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    CATALOGUE
        .iter()
        .find(|p| host == p.host || host.ends_with(&format!(".{}", p.host)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingInfo {
    pub status: String,
    pub agent_name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistributeOutcome {
    pub success: bool,
    pub warning: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarvestOutcome {
    pub success: bool,
    pub text: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("{0} (try restarting the agent endpoint)")]
    Unreachable(String),
    #[error("{0}")]
    Endpoint(String),
    #[error("unexpected reply from endpoint: {0}")]
    Protocol(String),
}

/// One chat site reachable by the node.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn ping(&self) -> Result<PingInfo, AdapterError>;
    async fn distribute_prompt(&self, text: &str) -> Result<DistributeOutcome, AdapterError>;
    async fn harvest_latest(&self) -> Result<HarvestOutcome, AdapterError>;
}

/// A reachable endpoint as reported by its host.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub id: String,
    pub url: String,
}

/// The environment's command surface for agent endpoints.
#[async_trait]
pub trait EndpointHost: Send + Sync {
    /// Enumerate endpoints that answer a ping.
    async fn query_endpoints(&self) -> Vec<Endpoint>;

    async fn send_to_endpoint(
        &self,
        id: &str,
        req: AdapterRequest,
    ) -> Result<AdapterResponse, AdapterError>;

    /// Label a set of endpoints as belonging together. Hosts without a notion
    /// of grouping ignore this.
    async fn group_endpoints(&self, _ids: &[String], _label: &str) {}
}

/// Endpoints as Unix sockets in one directory. Each connection carries one
/// request line and one response line.
pub struct SocketEndpointHost {
    dir: PathBuf,
}

impl SocketEndpointHost {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    async fn exchange(
        &self,
        path: &std::path::Path,
        req: &AdapterRequest,
    ) -> Result<AdapterResponse, AdapterError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| AdapterError::Unreachable(format!("{}: {e}", path.display())))?;
        let (r, w) = stream.into_split();
        let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_ENDPOINT_LINE));
        let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_ENDPOINT_LINE));

        let line = serde_json::to_string(req).map_err(|e| AdapterError::Protocol(e.to_string()))?;
        writer
            .send(line)
            .await
            .map_err(|e| AdapterError::Unreachable(e.to_string()))?;
        match reader.next().await {
            Some(Ok(line)) => {
                serde_json::from_str(&line).map_err(|e| AdapterError::Protocol(e.to_string()))
            }
            Some(Err(e)) => Err(AdapterError::Unreachable(e.to_string())),
            None => Err(AdapterError::Unreachable(
                "endpoint closed the connection".to_string(),
            )),
        }
    }
}

#[async_trait]
impl EndpointHost for SocketEndpointHost {
    async fn query_endpoints(&self) -> Vec<Endpoint> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), err = %e, "cannot read endpoints dir");
                return Vec::new();
            }
        };
        let mut sockets = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "sock") {
                sockets.push(path);
            }
        }
        sockets.sort();

        let mut endpoints = Vec::new();
        for path in sockets {
            match self.exchange(&path, &AdapterRequest::Ping).await {
                Ok(AdapterResponse::Pong { url, .. }) => endpoints.push(Endpoint {
                    id: path.to_string_lossy().into_owned(),
                    url,
                }),
                Ok(other) => {
                    tracing::debug!(endpoint = %path.display(), reply = ?other, "endpoint did not pong");
                }
                Err(e) => {
                    tracing::debug!(endpoint = %path.display(), err = %e, "endpoint unreachable");
                }
            }
        }
        endpoints
    }

    async fn send_to_endpoint(
        &self,
        id: &str,
        req: AdapterRequest,
    ) -> Result<AdapterResponse, AdapterError> {
        self.exchange(std::path::Path::new(id), &req).await
    }
}

/// Adapter for one endpoint of an [`EndpointHost`].
pub struct EndpointAdapter {
    host: Arc<dyn EndpointHost>,
    endpoint_id: String,
}

impl EndpointAdapter {
    pub fn new(host: Arc<dyn EndpointHost>, endpoint_id: String) -> Self {
        Self { host, endpoint_id }
    }

    async fn call(&self, req: AdapterRequest) -> Result<AdapterResponse, AdapterError> {
        match self.host.send_to_endpoint(&self.endpoint_id, req).await? {
            AdapterResponse::Error { message } => Err(AdapterError::Endpoint(message)),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl AgentAdapter for EndpointAdapter {
    async fn ping(&self) -> Result<PingInfo, AdapterError> {
        match self.call(AdapterRequest::Ping).await? {
            AdapterResponse::Pong {
                status,
                agent_name,
                url,
            } => Ok(PingInfo {
                status,
                agent_name,
                url,
            }),
            other => Err(AdapterError::Protocol(format!("{other:?}"))),
        }
    }

    async fn distribute_prompt(&self, text: &str) -> Result<DistributeOutcome, AdapterError> {
        let req = AdapterRequest::DistributePrompt {
            prompt: text.to_string(),
        };
        match self.call(req).await? {
            AdapterResponse::Distributed {
                success,
                warning,
                error,
            } => Ok(DistributeOutcome {
                success,
                warning,
                error,
            }),
            other => Err(AdapterError::Protocol(format!("{other:?}"))),
        }
    }

    async fn harvest_latest(&self) -> Result<HarvestOutcome, AdapterError> {
        match self.call(AdapterRequest::HarvestLatest).await? {
            AdapterResponse::Harvested {
                success,
                text,
                error,
            } => Ok(HarvestOutcome {
                success,
                text,
                error,
            }),
            other => Err(AdapterError::Protocol(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn catalogue_matches_site_hosts() {
        assert_eq!(match_profile("https://claude.ai/chat/123").unwrap().key, "claude");
        assert_eq!(match_profile("https://gemini.google.com/app").unwrap().name, "Gemini");
        assert_eq!(
            match_profile("https://aistudio.google.com/prompts/new").unwrap().key,
            "aistudio"
        );
        assert_eq!(match_profile("https://chatgpt.com/c/abc").unwrap().name, "ChatGPT");
        assert!(match_profile("https://example.com/claude.ai").is_none());
        assert!(match_profile("not a url").is_none());
    }

    #[test]
    fn catalogue_match_ignores_userinfo_port_and_case() {
        assert_eq!(
            match_profile("https://user:pw@claude.ai:8443/new").unwrap().key,
            "claude"
        );
        assert_eq!(match_profile("https://CHATGPT.com/").unwrap().key, "gpt");
        assert_eq!(
            match_profile("https://eu.gemini.google.com/app").unwrap().key,
            "gemini"
        );
        // The host is what counts, not text that merely looks like one.
        assert!(match_profile("https://claude.ai@evil.example/").is_none());
        assert!(match_profile("https://notclaude.ai/").is_none());
    }

    #[test]
    fn catalogue_match_rejects_ip_literals_and_bad_urls() {
        assert!(match_profile("http://[::1]:8080/").is_none());
        assert!(match_profile("http://127.0.0.1:80/claude.ai").is_none());
        assert!(match_profile("claude.ai/new").is_none());
        assert!(match_profile("").is_none());
    }

    #[test]
    fn unreachable_error_carries_hint() {
        let err = AdapterError::Unreachable("no such socket".to_string());
        assert!(err.to_string().contains("try restarting the agent endpoint"));
    }

    /// Serve `reply` to every connection on a socket named `name` in `dir`.
    fn serve_endpoint(dir: &std::path::Path, name: &str, reply: AdapterResponse) {
        let listener = UnixListener::bind(dir.join(name)).unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let reply = reply.clone();
                tokio::spawn(async move {
                    let (r, w) = stream.into_split();
                    let mut reader = FramedRead::new(r, LinesCodec::new());
                    let mut writer = FramedWrite::new(w, LinesCodec::new());
                    if reader.next().await.is_some() {
                        let line = serde_json::to_string(&reply).unwrap();
                        let _ = writer.send(line).await;
                    }
                });
            }
        });
    }

    #[tokio::test]
    async fn socket_host_discovers_endpoints_that_pong() {
        let dir = tempfile::tempdir().unwrap();
        serve_endpoint(
            dir.path(),
            "claude.sock",
            AdapterResponse::Pong {
                status: "ok".to_string(),
                agent_name: "Claude".to_string(),
                url: "https://claude.ai/new".to_string(),
            },
        );
        serve_endpoint(
            dir.path(),
            "broken.sock",
            AdapterResponse::Error {
                message: "boom".to_string(),
            },
        );
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let host = SocketEndpointHost::new(dir.path().to_path_buf());
        let endpoints = host.query_endpoints().await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].url, "https://claude.ai/new");
        assert!(endpoints[0].id.ends_with("claude.sock"));
    }

    #[tokio::test]
    async fn endpoint_adapter_maps_replies() {
        let dir = tempfile::tempdir().unwrap();
        serve_endpoint(
            dir.path(),
            "gpt.sock",
            AdapterResponse::Harvested {
                success: true,
                text: Some("42".to_string()),
                error: None,
            },
        );
        let host: Arc<dyn EndpointHost> = Arc::new(SocketEndpointHost::new(dir.path().to_path_buf()));
        let id = dir.path().join("gpt.sock").to_string_lossy().into_owned();
        let adapter = EndpointAdapter::new(host.clone(), id);

        let outcome = adapter.harvest_latest().await.unwrap();
        assert_eq!(outcome.text.as_deref(), Some("42"));
        // A harvest reply to a distribute request is a protocol error.
        assert!(matches!(
            adapter.distribute_prompt("hi").await,
            Err(AdapterError::Protocol(_))
        ));

        let missing = EndpointAdapter::new(host, dir.path().join("gone.sock").to_string_lossy().into_owned());
        assert!(matches!(missing.ping().await, Err(AdapterError::Unreachable(_))));
    }
}
