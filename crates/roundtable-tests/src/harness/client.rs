use anyhow::{Context, Result};
use roundtable::client::NodeClient;
use roundtable::model::{ChatEntry, RosterEntry};
use roundtable::protocol::{AgentInfo, PromptResult, Request, Response, SessionInfo};
use std::path::Path;

/// Convenience wrapper over `NodeClient` for integration tests.
pub struct TestClient {
    inner: NodeClient,
}

impl TestClient {
    /// Connect to a node daemon at the given socket path.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let inner = NodeClient::connect(socket_path).await?;
        Ok(Self { inner })
    }

    async fn typed<T: serde::de::DeserializeOwned>(&mut self, req: Request) -> Result<T> {
        let data = self.inner.request(req).await?.context("reply carried no data")?;
        Ok(serde_json::from_value(data)?)
    }

    /// Send a request, returning the raw Ok/Error response.
    pub async fn try_request(&mut self, req: Request) -> Result<Response> {
        self.inner.send(req).await?;
        loop {
            match self.inner.next_response().await? {
                Response::Event { .. } | Response::Hello { .. } => continue,
                resp => return Ok(resp),
            }
        }
    }

    pub async fn status(&mut self) -> Result<SessionInfo> {
        self.typed(Request::Status).await
    }

    /// Host a room and return its id.
    pub async fn host(&mut self, room_id: Option<&str>) -> Result<String> {
        let info: SessionInfo = self
            .typed(Request::StartHost {
                room_id: room_id.map(str::to_string),
            })
            .await?;
        info.room_id.context("hosted session has no room id")
    }

    pub async fn join(&mut self, room_id: &str) -> Result<SessionInfo> {
        self.typed(Request::JoinRoom {
            room_id: room_id.to_string(),
        })
        .await
    }

    pub async fn leave(&mut self) -> Result<SessionInfo> {
        self.typed(Request::LeaveSession).await
    }

    pub async fn say(&mut self, text: &str) -> Result<PromptResult> {
        self.typed(Request::SendPrompt {
            text: text.to_string(),
        })
        .await
    }

    pub async fn roll_call(&mut self) -> Result<PromptResult> {
        self.typed(Request::RollCall).await
    }

    pub async fn harvest(&mut self) -> Result<()> {
        self.inner.request(Request::Harvest).await?;
        Ok(())
    }

    pub async fn history(&mut self) -> Result<Vec<ChatEntry>> {
        self.typed(Request::History).await
    }

    pub async fn roster(&mut self) -> Result<Vec<RosterEntry>> {
        self.typed(Request::Roster).await
    }

    pub async fn delete(&mut self, index: usize) -> Result<()> {
        self.inner
            .request(Request::DeleteMessage {
                index,
                confirm: true,
            })
            .await?;
        Ok(())
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.inner
            .request(Request::ClearSession { confirm: true })
            .await?;
        Ok(())
    }

    pub async fn set_username(&mut self, username: &str) -> Result<()> {
        self.inner
            .request(Request::SetUsername {
                username: username.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn scan(&mut self) -> Result<Vec<AgentInfo>> {
        self.typed(Request::ScanAgents).await
    }

    pub async fn agents(&mut self) -> Result<Vec<AgentInfo>> {
        self.typed(Request::ListAgents).await
    }
}
