//! Inbound HTTP surface: the endpoints other instances call.

use crate::engine::SharingEngine;
use crate::error::SharingError;
use crate::protocol::{BulkDocs, ErrorBody, FileMetadataResponse, RevsDiff, SharingRequest};
use crate::sharing::Sharing;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{post, put};
use axum::Router;
use cumulus_store::RevisionedDoc;
use cumulus_types::{MemberId, SharingId};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Resolves bearer tokens presented by peers to the OAuth client they
/// were issued to.
pub trait TokenVerifier: Send + Sync {
    fn client_id(&self, token: &str) -> Option<String>;
}

/// A [`TokenVerifier`] over a fixed table of tokens.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: RwLock<HashMap<String, String>>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, client_id: impl Into<String>) {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.insert(token.into(), client_id.into());
    }
}

impl TokenVerifier for StaticTokens {
    fn client_id(&self, token: &str) -> Option<String> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens.get(token).cloned()
    }
}

/// State shared by the handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<SharingEngine>,
    pub verifier: Arc<dyn TokenVerifier>,
}

/// A [`SharingError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SharingError);

impl From<SharingError> for ApiError {
    fn from(error: SharingError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SharingError::NoRules
            | SharingError::NoRecipients
            | SharingError::InvalidRule(_)
            | SharingError::InvalidSharing(_)
            | SharingError::MissingUrl
            | SharingError::NoOAuthClient
            | SharingError::Serialization(_)
            | SharingError::Document(_) => StatusCode::BAD_REQUEST,
            SharingError::MemberNotFound(_) | SharingError::SharingNotFound(_) => StatusCode::NOT_FOUND,
            SharingError::Auth(_) => StatusCode::UNAUTHORIZED,
            SharingError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        debug!("Request failed with {}: {}", status, self.0);
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct RevocationQuery {
    #[serde(default)]
    recursive: bool,
}

/// Build the router of the peer-facing endpoints.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/sharings/{id}", put(receive_sharing).delete(receive_revocation))
        .route("/sharings/{id}/_revs_diff", post(revs_diff))
        .route("/sharings/{id}/_bulk_docs", post(bulk_docs))
        .route("/sharings/{id}/io.cozy.files/{file}/metadata", put(file_metadata))
        .route("/sharings/{id}/io.cozy.files/{file}", put(file_content))
        .with_state(state)
}

/// The member calling, from its bearer token.
fn authenticate(state: &ApiState, headers: &HeaderMap, sharing_id: &SharingId) -> ApiResult<(Sharing, MemberId)> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| SharingError::Auth("missing bearer token".to_string()))?;
    let client_id = state
        .verifier
        .client_id(token)
        .ok_or_else(|| SharingError::Auth("invalid token".to_string()))?;
    Ok(state.engine.authenticate(sharing_id, &client_id)?)
}

async fn receive_sharing(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<SharingRequest>,
) -> ApiResult<StatusCode> {
    if request.id.as_str() != id {
        return Err(SharingError::InvalidSharing("sharing id does not match the path".to_string()).into());
    }
    state.engine.receive_request(request).await?;
    Ok(StatusCode::CREATED)
}

async fn receive_revocation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<RevocationQuery>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let sharing_id = SharingId::from_string(id);
    let (_, member_id) = authenticate(&state, &headers, &sharing_id)?;
    state
        .engine
        .receive_revocation(&sharing_id, &member_id, query.recursive)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn revs_diff(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RevsDiff>,
) -> ApiResult<Json<RevsDiff>> {
    let sharing_id = SharingId::from_string(id);
    let (sharing, member_id) = authenticate(&state, &headers, &sharing_id)?;
    let missing = state.engine.handle_revs_diff(&sharing, &member_id, &request)?;
    Ok(Json(missing))
}

async fn bulk_docs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(docs): Json<BulkDocs>,
) -> ApiResult<StatusCode> {
    let sharing_id = SharingId::from_string(id);
    let (sharing, member_id) = authenticate(&state, &headers, &sharing_id)?;
    let written = state.engine.apply_bulk_docs(&sharing, &member_id, docs).await?;
    debug!("Applied {} document(s) from member {}", written, member_id);
    Ok(StatusCode::OK)
}

async fn file_metadata(
    State(state): State<ApiState>,
    Path((id, file_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(file): Json<RevisionedDoc>,
) -> ApiResult<Json<FileMetadataResponse>> {
    if file.doc.id != file_id {
        return Err(SharingError::InvalidSharing("file id does not match the path".to_string()).into());
    }
    let sharing_id = SharingId::from_string(id);
    let (sharing, member_id) = authenticate(&state, &headers, &sharing_id)?;
    let response = state
        .engine
        .receive_file_metadata(&sharing, &member_id, file)
        .await?;
    Ok(Json(response))
}

async fn file_content(
    State(state): State<ApiState>,
    Path((id, key)): Path<(String, String)>,
    headers: HeaderMap,
    content: Bytes,
) -> ApiResult<StatusCode> {
    let sharing_id = SharingId::from_string(id);
    let (sharing, member_id) = authenticate(&state, &headers, &sharing_id)?;
    state
        .engine
        .receive_file_content(&sharing, &member_id, &key, &content)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
