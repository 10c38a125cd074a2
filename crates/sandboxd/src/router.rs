use chrono::{DateTime, Utc};
use sandbox::ExecutionResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::orchestrator::SandboxOrchestrator;
use crate::types::{SandboxState, SandboxStatus, SandboxSummary, serialize_iso};

const MAX_LANGUAGE_LEN: usize = 32;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub language: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct SandboxRef {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendRequest {
    pub id: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub id: Uuid,
    pub poll_url: String,
    #[serde(serialize_with = "serialize_iso")]
    pub expires_at: DateTime<Utc>,
    pub state: SandboxState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendResponse {
    #[serde(serialize_with = "serialize_iso")]
    pub new_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub sandboxes: Vec<SandboxSummary>,
}

#[derive(Debug, Serialize)]
pub struct TerminateResponse {
    pub id: Uuid,
    pub state: SandboxState,
}

/// Validates inbound requests and hands them to the orchestrator.
#[derive(Clone)]
pub struct SubmissionRouter {
    orchestrator: SandboxOrchestrator,
}

impl SubmissionRouter {
    pub fn new(orchestrator: SandboxOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &SandboxOrchestrator {
        &self.orchestrator
    }

    pub async fn submit(&self, request: SubmitRequest) -> ServiceResult<SubmitResponse> {
        let language = normalize_language(&request.language)?;
        let limit = self.orchestrator.policy().max_source_bytes;
        if request.code.len() > limit {
            return Err(ServiceError::PayloadTooLarge {
                size: request.code.len(),
                limit,
            });
        }

        let record = self.orchestrator.create(&language, &request.code).await?;
        Ok(SubmitResponse {
            id: record.id,
            poll_url: format!("/sandboxes/{}", record.id),
            expires_at: record.expires_at,
            state: record.state,
        })
    }

    pub async fn execute(&self, request: SandboxRef) -> ServiceResult<ExecutionResult> {
        self.orchestrator.execute(parse_id(&request.id)?).await
    }

    pub fn extend(&self, request: ExtendRequest) -> ServiceResult<ExtendResponse> {
        let id = parse_id(&request.id)?;
        if request.ttl_seconds == 0 {
            return Err(ServiceError::InvalidRequest(
                "ttlSeconds must be positive".into(),
            ));
        }
        let new_expires_at = self.orchestrator.extend(id, request.ttl_seconds)?;
        Ok(ExtendResponse { new_expires_at })
    }

    pub fn list(&self) -> ServiceResult<ListResponse> {
        Ok(ListResponse {
            sandboxes: self.orchestrator.list()?,
        })
    }

    pub async fn terminate(&self, request: SandboxRef) -> ServiceResult<TerminateResponse> {
        let id = parse_id(&request.id)?;
        let state = self.orchestrator.terminate(id).await?;
        Ok(TerminateResponse { id, state })
    }

    pub fn status(&self, id: &str) -> ServiceResult<SandboxStatus> {
        self.orchestrator.status(parse_id(id)?)
    }
}

/// Ids are opaque to callers; anything that is not one of ours is unknown.
fn parse_id(raw: &str) -> ServiceResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| ServiceError::NotFound(raw.to_string()))
}

/// Lowercase and check the identifier shape before any catalog lookup.
fn normalize_language(raw: &str) -> ServiceResult<String> {
    let language = raw.trim().to_ascii_lowercase();
    let well_formed = !language.is_empty()
        && language.len() <= MAX_LANGUAGE_LEN
        && language
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+#-_".contains(&b));
    if !well_formed {
        return Err(ServiceError::UnsupportedLanguage(raw.to_string()));
    }
    Ok(language)
}
