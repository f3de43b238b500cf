//! CircleCI connector.
//!
//! Produces one raw record per workflow job of a project, walking the v2 API:
//!
//! ```text
//! GET /project/{slug}/pipeline            (next_page_token, newest first)
//!   └─ GET /pipeline/{id}/workflow
//!        ├─ GET /user/{started_by}        (workflow creator)
//!        └─ GET /workflow/{id}/job
//!             └─ GET /project/{slug}/job/{number}   (skipped for approval / blocked jobs)
//! ```
//!
//! The pipeline listing is newest-first, so no part of it can be written
//! before the whole window has been read: a marker taken from the first
//! listing page would jump past older pipelines still unread. A request
//! therefore walks every listing page down to the first pipeline older than
//! the lower bound, then returns the window as a single page of records in
//! ascending `updated_at` order. Workflows whose timestamp is before the
//! bound are skipped.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.circleci.app]
//! project = "gh/acme/app"
//! index = "sds-acme-app-circleci"
//! token_env = "CIRCLECI_TOKEN"
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{env_secret, CircleCiConnectorConfig, SyncConfig};
use crate::http::HttpClient;
use crate::ids::stable_uuid;
use crate::models::RawRecord;
use crate::source::{next_cursor, Cursor, Page, PageRequest};
use crate::traits::{AuthorRef, Connector};

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Actor {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Deserialize, Default)]
struct Trigger {
    #[serde(default)]
    actor: Actor,
}

#[derive(Debug, Deserialize)]
struct Pipeline {
    id: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    trigger: Trigger,
}

#[derive(Debug, Deserialize)]
struct Workflow {
    id: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    started_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Job {
    id: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    job_number: Option<i64>,
    #[serde(default)]
    project_slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

/// Decode an API item, keeping the untouched JSON for the record payload.
fn decode<T: DeserializeOwned>(value: &Value, what: &str, skipped: &mut usize) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(what, error = %e, "skipping malformed item");
            *skipped += 1;
            None
        }
    }
}

pub struct CircleCiConnector {
    name: String,
    project: String,
    index: String,
    api_url: String,
    token: String,
    http: HttpClient,
}

impl CircleCiConnector {
    pub fn new(
        name: &str,
        project: &str,
        index: &str,
        api_url: &str,
        token: String,
        http: HttpClient,
    ) -> Self {
        Self {
            name: name.to_string(),
            project: project.to_string(),
            index: index.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            http,
        }
    }

    /// Build from config. The API token is read from the environment here
    /// so a missing credential fails before any phase starts.
    pub fn from_config(name: &str, cfg: &CircleCiConnectorConfig, sync: &SyncConfig) -> Result<Self> {
        let token = env_secret(&cfg.token_env)
            .with_context(|| format!("circleci:{} requires an API token", name))?;
        let http = HttpClient::new(sync.http_timeout(), sync.http_retries)?;
        Ok(Self::new(name, &cfg.project, &cfg.index, &cfg.api_url, token, http))
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Circle-Token", self.token.clone()),
            ("Accept", "application/json".to_string()),
        ]
    }

    /// Collect every page of a sub-resource listing.
    async fn list_all(&self, url: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let params: Vec<(&str, String)> = token
                .take()
                .map(|t| vec![("page-token", t)])
                .unwrap_or_default();
            let (list, _): (ListResponse, _) = self.http.get_json(url, &self.headers(), &params).await?;
            items.extend(list.items);
            match list.next_page_token.filter(|t| !t.is_empty()) {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(items)
    }

    async fn workflow_creator(&self, workflow: &Workflow, pipeline: &Pipeline) -> (String, bool) {
        let fallback = (pipeline.trigger.actor.login.clone(), true);
        let Some(ref user_id) = workflow.started_by else {
            return fallback;
        };
        let url = format!("{}/user/{}", self.api_url, user_id);
        match self.http.get_json::<User>(&url, &self.headers(), &[]).await {
            Ok((user, _)) => (user.login, false),
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "workflow creator lookup failed, using trigger actor");
                fallback
            }
        }
    }

    async fn job_details(&self, job: &Job) -> Result<Value> {
        if job.kind == "approval" || job.status == "blocked" {
            return Ok(Value::Null);
        }
        let Some(number) = job.job_number else {
            return Ok(Value::Null);
        };
        let slug = job.project_slug.as_deref().unwrap_or(&self.project);
        let url = format!("{}/project/{}/job/{}", self.api_url, slug, number);
        let (details, _) = self.http.get_json(&url, &self.headers(), &[]).await?;
        Ok(details)
    }

    /// Walk the pipeline listing from `start` until it runs out or reaches
    /// a pipeline older than `since`. Returns the window oldest-first.
    async fn window_pipelines(
        &self,
        start: Option<Cursor>,
        since: DateTime<Utc>,
        skipped: &mut usize,
    ) -> Result<Vec<(Value, Pipeline)>> {
        let listing = format!("{}/project/{}/pipeline", self.api_url, self.project);
        let mut cursor = start;
        let mut window = Vec::new();
        let mut pages = 0usize;

        loop {
            let (url, params) = match cursor.take() {
                None => (listing.clone(), Vec::new()),
                Some(Cursor::Token(t)) => (listing.clone(), vec![("page-token", t)]),
                Some(Cursor::Link(url)) => (url, Vec::new()),
                Some(Cursor::Offset(_)) => break,
            };
            let (list, headers): (ListResponse, _) = self
                .http
                .get_json(&url, &self.headers(), &params)
                .await
                .with_context(|| format!("Failed to list pipelines of {}", self.project))?;
            pages += 1;

            let mut reached_old = false;
            for raw in list.items {
                let Some(pipeline) = decode::<Pipeline>(&raw, "pipeline", skipped) else {
                    continue;
                };
                if pipeline.updated_at.unwrap_or(pipeline.created_at) < since {
                    reached_old = true;
                    continue;
                }
                window.push((raw, pipeline));
            }
            if reached_old {
                break;
            }
            match next_cursor(list.next_page_token.as_deref(), Some(&headers)) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(project = %self.project, pages, pipelines = window.len(), "pipeline window listed");
        window.reverse();
        Ok(window)
    }

    async fn pipeline_records(
        &self,
        pipeline_raw: &Value,
        pipeline: &Pipeline,
        since: DateTime<Utc>,
        skipped: &mut usize,
    ) -> Result<Vec<RawRecord>> {
        let mut records = Vec::new();
        let workflows = self
            .list_all(&format!("{}/pipeline/{}/workflow", self.api_url, pipeline.id))
            .await?;

        for wf_raw in &workflows {
            let Some(workflow) = decode::<Workflow>(wf_raw, "workflow", skipped) else {
                continue;
            };
            let updated_at = workflow.stopped_at.unwrap_or(workflow.created_at);
            if updated_at < since {
                continue;
            }

            let (creator, creator_bot) = self.workflow_creator(&workflow, pipeline).await;
            let jobs = self
                .list_all(&format!("{}/workflow/{}/job", self.api_url, workflow.id))
                .await?;

            for job_raw in &jobs {
                let Some(job) = decode::<Job>(job_raw, "job", skipped) else {
                    continue;
                };
                let details = self.job_details(&job).await?;
                let uuid = stable_uuid(&[&job.id, &pipeline.id, &workflow.id])?;
                records.push(RawRecord {
                    uuid,
                    origin: self.project.clone(),
                    fetched_at: Utc::now(),
                    updated_at,
                    payload: json!({
                        "pipeline": pipeline_raw,
                        "workflow": wf_raw,
                        "job": job_raw,
                        "job_details": details,
                        "workflow_creator": { "login": creator, "bot": creator_bot },
                    }),
                });
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl Connector for CircleCiConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "CircleCI pipelines, workflows and jobs"
    }

    fn connector_type(&self) -> &str {
        "circleci"
    }

    fn origin(&self) -> &str {
        &self.project
    }

    fn index(&self) -> &str {
        &self.index
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        // The window is always delivered whole; an engine offset past it
        // has nothing left to return.
        if let Some(Cursor::Offset(_)) = request.cursor {
            return Ok(Page::empty());
        }

        let mut skipped = 0usize;
        let pipelines = self
            .window_pipelines(request.cursor.clone(), request.since, &mut skipped)
            .await?;

        let mut records = Vec::new();
        for (raw, pipeline) in &pipelines {
            records.extend(
                self.pipeline_records(raw, pipeline, request.since, &mut skipped)
                    .await?,
            );
        }
        records.sort_by_key(|r| r.updated_at);

        debug!(
            project = %self.project,
            records = records.len(),
            skipped,
            "pipeline window fetched"
        );
        Ok(Page {
            records,
            skipped,
            next_cursor: None,
        })
    }

    fn author(&self, record: &RawRecord) -> Option<AuthorRef> {
        let creator = record.payload.get("workflow_creator")?;
        let handle = creator.get("login")?.as_str()?.trim();
        if handle.is_empty() {
            return None;
        }
        Some(AuthorRef {
            handle: handle.to_string(),
            automated: creator.get("bot").and_then(|b| b.as_bool()).unwrap_or(false),
        })
    }

    fn enrich_fields(&self, record: &RawRecord) -> Result<Map<String, Value>> {
        let p = &record.payload;
        let (Some(pipeline), Some(workflow), Some(job)) = (
            p.get("pipeline").filter(|v| v.is_object()),
            p.get("workflow").filter(|v| v.is_object()),
            p.get("job").filter(|v| v.is_object()),
        ) else {
            bail!("record {} is missing pipeline, workflow or job", record.uuid);
        };
        let details = p.get("job_details").unwrap_or(&Value::Null);
        let vcs = pipeline.get("vcs").unwrap_or(&Value::Null);

        let job_type = job.get("type").and_then(|v| v.as_str()).unwrap_or_default();
        let tag = vcs.get("tag").and_then(|v| v.as_str()).unwrap_or_default();
        let branch = vcs.get("branch").and_then(|v| v.as_str()).unwrap_or_default();

        let mut fields = Map::new();
        let mut put = |k: &str, v: Value| {
            if !v.is_null() {
                fields.insert(k.to_string(), v);
            }
        };

        put("project_slug", pipeline["project_slug"].clone());
        put("pipeline_id", pipeline["id"].clone());
        put("pipeline_number", pipeline["number"].clone());
        put("pipeline_state", pipeline["state"].clone());
        put("pipeline_created_at", pipeline["created_at"].clone());
        put("pipeline_trigger_type", pipeline["trigger"]["type"].clone());
        put("workflow_id", workflow["id"].clone());
        put("workflow_name", workflow["name"].clone());
        put("workflow_status", workflow["status"].clone());
        put("workflow_created_at", workflow["created_at"].clone());
        put("workflow_stopped_at", workflow["stopped_at"].clone());
        put("job_id", job["id"].clone());
        put("job_name", job["name"].clone());
        put("job_type", job["type"].clone());
        put("job_status", job["status"].clone());
        put("job_dependencies", job["dependencies"].clone());
        put("is_approval", Value::Bool(job_type == "approval"));
        put("job_number", details["number"].clone());
        put("job_duration", details["duration"].clone());
        put("job_parallelism", details["parallelism"].clone());
        put("job_queued_at", details["queued_at"].clone());
        put("job_executor_type", details["executor"]["type"].clone());
        put("job_executor_resource_class", details["executor"]["resource_class"].clone());
        put("repository_url", vcs["target_repository_url"].clone());
        put("revision", vcs["revision"].clone());
        if !tag.is_empty() {
            put("tag", Value::from(tag));
            put("is_release", Value::Bool(true));
        }
        if !branch.is_empty() {
            put("branch", Value::from(branch));
            put("commit_subject", vcs["commit"]["subject"].clone());
        }
        put("grimoire_creation_date", workflow["created_at"].clone());

        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn connector() -> CircleCiConnector {
        let http = HttpClient::new(Duration::from_secs(1), 0).unwrap();
        CircleCiConnector::new("app", "gh/acme/app", "sds-acme-app", "http://127.0.0.1:1", "t".into(), http)
    }

    fn record(payload: Value) -> RawRecord {
        RawRecord {
            uuid: "u".into(),
            origin: "gh/acme/app".into(),
            fetched_at: Utc::now(),
            updated_at: Utc::now(),
            payload,
        }
    }

    #[test]
    fn author_comes_from_workflow_creator() {
        let c = connector();
        let r = record(json!({ "workflow_creator": { "login": "alice", "bot": true } }));
        assert_eq!(
            c.author(&r),
            Some(AuthorRef {
                handle: "alice".into(),
                automated: true
            })
        );
        assert_eq!(c.author(&record(json!({}))), None);
    }

    #[test]
    fn enrich_fields_flatten_job_and_vcs() {
        let c = connector();
        let r = record(json!({
            "pipeline": { "id": "p1", "number": 7, "vcs": { "tag": "v1.0", "branch": "" } },
            "workflow": { "id": "w1", "name": "build", "created_at": "2024-01-01T00:00:00Z" },
            "job": { "id": "j1", "type": "build", "status": "success" },
            "job_details": { "duration": 1234, "executor": { "type": "docker" } },
        }));
        let f = c.enrich_fields(&r).unwrap();
        assert_eq!(f["pipeline_number"], 7);
        assert_eq!(f["job_duration"], 1234);
        assert_eq!(f["job_executor_type"], "docker");
        assert_eq!(f["is_release"], true);
        assert_eq!(f["is_approval"], false);
        assert!(!f.contains_key("branch"));
        assert_eq!(f["grimoire_creation_date"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn enrich_fields_reject_incomplete_payload() {
        let c = connector();
        assert!(c.enrich_fields(&record(json!({ "job": {} }))).is_err());
    }

    #[tokio::test]
    async fn offset_cursor_yields_empty_page() {
        let c = connector();
        let page = c
            .fetch_page(&PageRequest {
                stream: "fetch".into(),
                since: Utc::now(),
                cursor: Some(Cursor::Offset(20)),
                limit: 20,
            })
            .await
            .unwrap();
        assert_eq!(page.fetched(), 0);
        assert!(page.next_cursor.is_none());
    }
}
