//! Contributor identity resolution.
//!
//! The enrich phase maps each record's author handle to an [`Identity`]
//! through an [`IdentityService`]. Lookups go through an [`IdentityCache`]
//! scoped to one sync invocation:
//!
//! - a hit never calls upstream
//! - a miss calls [`IdentityService::resolve_by_key`] exactly once
//! - successes are cached, failures are not (the next record with the same
//!   key tries again) and yield a placeholder "Unknown" identity
//!
//! The cache takes `&mut self` and is owned by the enrich task. If
//! enrichment is ever parallelized it needs its own synchronization.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::http::HttpClient;
use crate::models::{Enrollment, Identity, UNKNOWN};

// ═══════════════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Username,
    Email,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Username => "username",
            KeyKind::Email => "email",
        }
    }
}

/// Natural key an identity is requested (and cached) under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub kind: KeyKind,
    pub value: String,
}

impl IdentityKey {
    pub fn username(value: impl Into<String>) -> Self {
        Self {
            kind: KeyKind::Username,
            value: value.into(),
        }
    }

    pub fn email(value: impl Into<String>) -> Self {
        Self {
            kind: KeyKind::Email,
            value: value.into(),
        }
    }

    /// Email if the handle contains `@`, username otherwise.
    pub fn from_handle(handle: &str) -> Self {
        let handle = handle.trim();
        if handle.contains('@') {
            Self::email(handle)
        } else {
            Self::username(handle)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Service Trait
// ═══════════════════════════════════════════════════════════════════════

/// Remote identity/affiliation service.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Whether lookups should be attempted at all.
    fn enabled(&self) -> bool {
        true
    }

    /// Resolve an identity from a natural key. Organization fields of the
    /// returned identity are ignored; they come from
    /// [`resolve_organizations`](IdentityService::resolve_organizations).
    async fn resolve_by_key(&self, key: &IdentityKey) -> Result<Identity>;

    /// All enrollments of the identity, in service order.
    async fn resolve_organizations(&self, uuid: &str, as_of: DateTime<Utc>) -> Result<Vec<Enrollment>>;
}

/// Pick the organization for `as_of`.
///
/// The enrollment whose interval contains `as_of` wins; if none does, the
/// first enrollment is used; an empty list yields "Unknown". The second
/// value lists every organization of the identity.
pub fn select_organization(enrollments: &[Enrollment], as_of: DateTime<Utc>) -> (String, Vec<String>) {
    let Some(first) = enrollments.first() else {
        return (UNKNOWN.to_string(), vec![UNKNOWN.to_string()]);
    };

    let chosen = enrollments
        .iter()
        .find(|e| e.contains(as_of))
        .unwrap_or(first);

    let mut all: Vec<String> = Vec::new();
    for e in enrollments {
        if !all.contains(&e.organization) {
            all.push(e.organization.clone());
        }
    }

    (chosen.organization.clone(), all)
}

// ═══════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════

struct CachedIdentity {
    identity: Identity,
    /// `None` when organization lookup failed; retried on the next hit.
    enrollments: Option<Vec<Enrollment>>,
}

/// Read-through identity cache for one sync invocation.
pub struct IdentityCache {
    service: Arc<dyn IdentityService>,
    entries: HashMap<IdentityKey, CachedIdentity>,
    hits: u64,
    misses: u64,
    failures: u64,
}

impl IdentityCache {
    pub fn new(service: Arc<dyn IdentityService>) -> Self {
        Self {
            service,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            failures: 0,
        }
    }

    /// Resolve `key` as of `as_of`. Never fails: when the service cannot
    /// answer, the placeholder identity is returned with `is_bot` set to
    /// `automated` (the record's own trigger metadata).
    pub async fn resolve(&mut self, key: &IdentityKey, as_of: DateTime<Utc>, automated: bool) -> Identity {
        if !self.service.enabled() || key.value.is_empty() {
            return Identity::unknown(automated);
        }

        if self.entries.contains_key(key) {
            self.hits += 1;
        } else {
            self.misses += 1;
            match self.service.resolve_by_key(key).await {
                Ok(identity) => {
                    self.entries.insert(
                        key.clone(),
                        CachedIdentity {
                            identity,
                            enrollments: None,
                        },
                    );
                }
                Err(e) => {
                    self.failures += 1;
                    warn!(kind = key.kind.as_str(), key = %key.value, error = %e, "identity lookup failed");
                    return Identity::unknown(automated);
                }
            }
        }

        let service = self.service.clone();
        let Some(entry) = self.entries.get_mut(key) else {
            return Identity::unknown(automated);
        };

        if entry.enrollments.is_none() {
            entry.enrollments = match entry.identity.uuid.as_deref() {
                Some(uuid) => match service.resolve_organizations(uuid, as_of).await {
                    Ok(list) => Some(list),
                    Err(e) => {
                        warn!(uuid, error = %e, "organization lookup failed");
                        None
                    }
                },
                None => Some(Vec::new()),
            };
        }

        let mut identity = entry.identity.clone();
        let (org, all) = select_organization(entry.enrollments.as_deref().unwrap_or(&[]), as_of);
        identity.org_name = org;
        identity.multi_org_names = all;
        debug!(key = %key.value, org = %identity.org_name, "identity resolved");
        identity
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses, failures)` since the cache was created.
    pub fn stats(&self) -> (u64, u64, u64) {
        (self.hits, self.misses, self.failures)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Implementations
// ═══════════════════════════════════════════════════════════════════════

/// Service used when no affiliation API is configured. Every record gets
/// the placeholder identity without any network call.
pub struct DisabledIdentityService;

#[async_trait]
impl IdentityService for DisabledIdentityService {
    fn enabled(&self) -> bool {
        false
    }

    async fn resolve_by_key(&self, _key: &IdentityKey) -> Result<Identity> {
        Err(anyhow!("identity resolution is disabled"))
    }

    async fn resolve_organizations(&self, _uuid: &str, _as_of: DateTime<Utc>) -> Result<Vec<Enrollment>> {
        Err(anyhow!("identity resolution is disabled"))
    }
}

#[derive(Debug, Deserialize)]
struct IdentityDto {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ProfileDto {
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize)]
struct OrganizationDto {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EnrollmentDto {
    organization: OrganizationDto,
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct FullProfileDto {
    #[serde(default)]
    profile: ProfileDto,
    #[serde(default)]
    enrollments: Vec<EnrollmentDto>,
}

/// HTTP client for the affiliation API.
///
/// - `GET {base}/v1/affiliation/identity/{kind}/{value}`
/// - `GET {base}/v1/affiliation/{project}/get_profile/{uuid}`
///
/// Path values are percent-encoded. The profile read while resolving a key
/// (for the bot flag) also carries the enrollments; they are held until the
/// matching [`resolve_organizations`](IdentityService::resolve_organizations)
/// call so one resolution reads the profile once.
pub struct AffiliationClient {
    http: HttpClient,
    base_url: String,
    project_slug: String,
    token: Option<String>,
    pending: Mutex<HashMap<String, Vec<Enrollment>>>,
}

fn enrollments(profile: FullProfileDto) -> Vec<Enrollment> {
    profile
        .enrollments
        .into_iter()
        .map(|e| Enrollment {
            organization: e.organization.name,
            start: e.start,
            end: e.end,
        })
        .collect()
}

impl AffiliationClient {
    pub fn new(http: HttpClient, base_url: &str, project_slug: &str, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_slug: project_slug.to_string(),
            token,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        match self.token {
            Some(ref t) => vec![("Authorization", format!("Bearer {}", t))],
            None => Vec::new(),
        }
    }

    /// `{base}/v1/affiliation/` followed by `segments`, each encoded.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid affiliation base URL '{}'", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("affiliation base URL '{}' cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(["v1", "affiliation"])
            .extend(segments);
        Ok(url)
    }

    async fn profile(&self, uuid: &str) -> Result<FullProfileDto> {
        let url = self.url(&[self.project_slug.as_str(), "get_profile", uuid])?;
        let resp = self
            .http
            .request(Method::GET, url.as_str(), &self.headers(), None, &[])
            .await?
            .error_for_status("affiliation profile lookup")?;
        resp.json()
    }
}

#[async_trait]
impl IdentityService for AffiliationClient {
    async fn resolve_by_key(&self, key: &IdentityKey) -> Result<Identity> {
        let url = self.url(&["identity", key.kind.as_str(), key.value.as_str()])?;
        let resp = self
            .http
            .request(Method::GET, url.as_str(), &self.headers(), None, &[])
            .await?;
        if resp.status == 404 {
            return Err(anyhow!("no identity for {} '{}'", key.kind.as_str(), key.value));
        }
        let dto: IdentityDto = resp.error_for_status("affiliation identity lookup")?.json()?;

        let is_bot = match dto.uuid.as_deref() {
            Some(uuid) => {
                let profile = self.profile(uuid).await?;
                let is_bot = profile.profile.is_bot;
                if let Ok(mut pending) = self.pending.lock() {
                    pending.insert(uuid.to_string(), enrollments(profile));
                }
                is_bot
            }
            None => false,
        };

        let username = dto.username.unwrap_or_else(|| key.value.clone());
        let email = dto.email.or_else(|| match key.kind {
            KeyKind::Email => Some(key.value.clone()),
            KeyKind::Username => None,
        });
        let domain = dto
            .domain
            .or_else(|| {
                email
                    .as_deref()
                    .and_then(|e| e.split_once('@'))
                    .map(|(_, d)| d.to_string())
            })
            .unwrap_or_else(|| UNKNOWN.to_string());

        Ok(Identity {
            id: dto.id,
            uuid: dto.uuid,
            name: dto.name.unwrap_or_else(|| username.clone()),
            username,
            email,
            domain,
            org_name: UNKNOWN.to_string(),
            is_bot,
            multi_org_names: Vec::new(),
        })
    }

    async fn resolve_organizations(&self, uuid: &str, _as_of: DateTime<Utc>) -> Result<Vec<Enrollment>> {
        let held = self.pending.lock().ok().and_then(|mut p| p.remove(uuid));
        if let Some(list) = held {
            return Ok(list);
        }
        Ok(enrollments(self.profile(uuid).await?))
    }
}
