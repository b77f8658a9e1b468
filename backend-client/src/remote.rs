//! REST implementation of [`RemoteStore`].
//!
//! Every request is scoped to one tenant:
//!
//! - `GET|PUT /tenants/{tenant}/inbox`
//! - `GET|PUT /tenants/{tenant}/scopes`
//! - `GET|PUT /tenants/{tenant}/timeline-overrides`
//! - `GET /tenants/{tenant}/boards/{board|all}/tasks`
//! - `POST /tenants/{tenant}/tasks/commands` (200 with the task, or 204)

use async_trait::async_trait;
use huddle_sync_core::RemoteError;
use huddle_sync_core::RemoteStore;
use huddle_sync_core::model::BoardSelector;
use huddle_sync_core::model::InboxSnapshot;
use huddle_sync_core::model::RequestContext;
use huddle_sync_core::model::ScopeWindowsState;
use huddle_sync_core::model::Task;
use huddle_sync_core::model::TimelineOverrides;
use huddle_sync_core::remote::TaskCommand;
use reqwest::Method;
use reqwest::Response;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::Backend;

/// Error body shape used by the backend. Anything else is passed through raw.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error", alias = "msg")]
    message: String,
}

pub struct HttpRemoteStore {
    backend: Backend,
}

impl HttpRemoteStore {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn tenant_path(ctx: &RequestContext, resource: &str) -> String {
        format!("tenants/{}/{resource}", ctx.tenant_id)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        resource: &str,
    ) -> Result<T, RemoteError> {
        let path = Self::tenant_path(ctx, resource);
        let response = self
            .backend
            .scoped(Method::GET, &path, ctx)
            .send()
            .await
            .map_err(transport)?;
        decode(check(response).await?).await
    }

    async fn put_json<T: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        resource: &str,
        body: &T,
    ) -> Result<(), RemoteError> {
        let path = Self::tenant_path(ctx, resource);
        let response = self
            .backend
            .scoped(Method::PUT, &path, ctx)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        Ok(())
    }
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

/// Turn a non-2xx answer into [`RemoteError::Status`].
async fn check(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => parsed.message,
        Err(_) if body.is_empty() => status
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
        Err(_) => body,
    };
    Err(RemoteError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let bytes = response.bytes().await.map_err(transport)?;
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_inbox(&self, ctx: &RequestContext) -> Result<InboxSnapshot, RemoteError> {
        self.get_json(ctx, "inbox").await
    }

    async fn put_inbox(&self, ctx: &RequestContext, inbox: &InboxSnapshot) -> Result<(), RemoteError> {
        self.put_json(ctx, "inbox", inbox).await
    }

    async fn fetch_scopes(&self, ctx: &RequestContext) -> Result<ScopeWindowsState, RemoteError> {
        self.get_json(ctx, "scopes").await
    }

    async fn put_scopes(&self, ctx: &RequestContext, scopes: &ScopeWindowsState) -> Result<(), RemoteError> {
        self.put_json(ctx, "scopes", scopes).await
    }

    async fn fetch_timeline(&self, ctx: &RequestContext) -> Result<TimelineOverrides, RemoteError> {
        self.get_json(ctx, "timeline-overrides").await
    }

    async fn put_timeline(
        &self,
        ctx: &RequestContext,
        overrides: &TimelineOverrides,
    ) -> Result<(), RemoteError> {
        self.put_json(ctx, "timeline-overrides", overrides).await
    }

    async fn list_tasks(&self, ctx: &RequestContext, board: &BoardSelector) -> Result<Vec<Task>, RemoteError> {
        let resource = format!("boards/{}/tasks", board.as_path_segment());
        self.get_json(ctx, &resource).await
    }

    async fn execute(&self, ctx: &RequestContext, command: &TaskCommand) -> Result<Option<Task>, RemoteError> {
        let path = Self::tenant_path(ctx, "tasks/commands");
        tracing::debug!("POST {path}: {}", command.action());
        let response = self
            .backend
            .scoped(Method::POST, &path, ctx)
            .json(command)
            .send()
            .await
            .map_err(transport)?;
        let response = check(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_sync_core::model::TenantId;
    use huddle_sync_core::model::UserId;
    use pretty_assertions::assert_eq;

    #[test]
    fn tenant_paths() {
        let ctx = RequestContext {
            tenant_id: TenantId::new("h1"),
            user_id: UserId::new("u1"),
        };
        assert_eq!(
            HttpRemoteStore::tenant_path(&ctx, "timeline-overrides"),
            "tenants/h1/timeline-overrides"
        );
    }

    #[test]
    fn error_body_accepts_common_field_names() {
        let parsed: ErrorBody = serde_json::from_str(r#"{"error":"forbidden"}"#).unwrap();
        assert_eq!(parsed.message, "forbidden");
    }
}
