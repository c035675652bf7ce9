use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use roundtable::adapter_protocol::{AdapterRequest, AdapterResponse};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

#[derive(Default)]
struct Script {
    prompts: Vec<String>,
    reply: Option<String>,
}

/// A fake agent endpoint: a Unix socket that answers the endpoint protocol,
/// records prompts, and replies to harvests with a scripted text.
pub struct FakeEndpoint {
    script: Arc<Mutex<Script>>,
    task: JoinHandle<()>,
}

impl FakeEndpoint {
    /// Listen on `<dir>/<name>.sock`, reporting `url` as the page it drives.
    pub fn spawn(dir: &Path, name: &str, url: &str) -> Result<Self> {
        let path = dir.join(format!("{name}.sock"));
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        let script = Arc::new(Mutex::new(Script::default()));
        let url = url.to_string();
        let agent_name = name.to_string();
        let shared = script.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let script = shared.clone();
                let url = url.clone();
                let agent_name = agent_name.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_one(stream, &script, &agent_name, &url).await {
                        tracing::debug!(err = %e, "fake endpoint exchange failed");
                    }
                });
            }
        });
        Ok(Self { script, task })
    }

    /// Text returned by the next harvests.
    pub fn set_reply(&self, text: &str) {
        if let Ok(mut script) = self.script.lock() {
            script.reply = Some(text.to_string());
        }
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.script
            .lock()
            .map(|s| s.prompts.clone())
            .unwrap_or_default()
    }

    /// Poll until at least `count` prompts arrived, or timeout.
    pub async fn wait_prompts(&self, count: usize, timeout: std::time::Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let prompts = self.prompts();
            if prompts.len() >= count || tokio::time::Instant::now() >= deadline {
                return prompts;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

impl Drop for FakeEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(
    stream: UnixStream,
    script: &Mutex<Script>,
    agent_name: &str,
    url: &str,
) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new());
    let mut writer = FramedWrite::new(w, LinesCodec::new());
    let Some(line) = reader.next().await else {
        return Ok(());
    };
    let req: AdapterRequest = serde_json::from_str(&line?)?;
    let resp = {
        let mut script = script
            .lock()
            .map_err(|_| anyhow::anyhow!("script lock poisoned"))?;
        match req {
            AdapterRequest::Ping => AdapterResponse::Pong {
                status: "ready".to_string(),
                agent_name: agent_name.to_string(),
                url: url.to_string(),
            },
            AdapterRequest::DistributePrompt { prompt } => {
                script.prompts.push(prompt);
                AdapterResponse::Distributed {
                    success: true,
                    warning: None,
                    error: None,
                }
            }
            AdapterRequest::HarvestLatest => match &script.reply {
                Some(text) => AdapterResponse::Harvested {
                    success: true,
                    text: Some(text.clone()),
                    error: None,
                },
                None => AdapterResponse::Harvested {
                    success: false,
                    text: None,
                    error: Some("no reply on the page yet".to_string()),
                },
            },
        }
    };
    writer.send(serde_json::to_string(&resp)?).await?;
    Ok(())
}
