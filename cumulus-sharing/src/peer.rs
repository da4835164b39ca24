//! HTTP client for the peer surface of other instances.

use crate::error::{SharingError, SharingResult};
use crate::member::{AccessToken, OAuthClient};
use crate::protocol::{
    BulkDocs, ClientRegistration, ClientRegistrationResponse, FileMetadataResponse, RevsDiff,
    SharingRequest, TokenResponse,
};
use cumulus_store::RevisionedDoc;
use cumulus_types::doctype::FILES;
use cumulus_types::SharingId;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::debug;

/// Calls the OAuth and sharing endpoints of peer instances.
#[derive(Debug, Clone)]
pub struct PeerClient {
    client: Client,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> SharingResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SharingError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    // ── OAuth ────────────────────────────────────────────────────

    /// Registers an OAuth client on a peer instance.
    pub async fn register_client(
        &self,
        instance: &str,
        registration: &ClientRegistration,
    ) -> SharingResult<OAuthClient> {
        let response = self
            .client
            .post(endpoint(instance, "/auth/register"))
            .json(registration)
            .send()
            .await
            .map_err(|e| SharingError::Network(format!("client registration failed: {e}")))?;
        let response = check(response).await?;

        let registered: ClientRegistrationResponse = response
            .json()
            .await
            .map_err(|e| SharingError::Auth(format!("failed to parse registration response: {e}")))?;
        Ok(OAuthClient {
            client_id: registered.client_id,
            client_secret: registered.client_secret,
            registration_token: registered.registration_access_token,
        })
    }

    /// Exchanges a refresh token for a new access token.
    pub async fn refresh_token(
        &self,
        instance: &str,
        client: &OAuthClient,
        refresh_token: &str,
    ) -> SharingResult<AccessToken> {
        let response = self
            .client
            .post(endpoint(instance, "/auth/access_token"))
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| SharingError::Network(format!("token refresh failed: {e}")))?;

        if !response.status().is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(SharingError::Auth(format!("token refresh failed: {error}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SharingError::Auth(format!("failed to parse token response: {e}")))?;
        Ok(AccessToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            scope: token.scope.unwrap_or_default(),
        })
    }

    /// Deletes a client we registered on a peer instance.
    pub async fn delete_client(&self, instance: &str, client: &OAuthClient) -> SharingResult<()> {
        let token = client
            .registration_token
            .as_deref()
            .unwrap_or(client.client_secret.as_str());
        let response = self
            .client
            .delete(endpoint(
                instance,
                &format!("/auth/register/{}", urlencoding::encode(&client.client_id)),
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SharingError::Network(format!("client deletion failed: {e}")))?;
        check(response).await?;
        Ok(())
    }

    // ── Sharing lifecycle ────────────────────────────────────────

    /// Sends the description of a sharing to a new member.
    pub async fn put_sharing(&self, instance: &str, request: &SharingRequest) -> SharingResult<()> {
        let response = self
            .client
            .put(endpoint(instance, &sharing_path(&request.id, "")))
            .json(request)
            .send()
            .await
            .map_err(|e| SharingError::Network(format!("sharing request failed: {e}")))?;
        check(response).await?;
        debug!("Sent sharing {} to {}", request.id, instance);
        Ok(())
    }

    /// Tells a peer a sharing is revoked.
    ///
    /// `recursive` is set by an owner revoking the peer; a recipient
    /// leaving the sharing sends it unset.
    pub async fn delete_sharing(
        &self,
        instance: &str,
        sharing_id: &SharingId,
        token: &str,
        recursive: bool,
    ) -> SharingResult<()> {
        let response = self
            .client
            .delete(endpoint(instance, &sharing_path(sharing_id, "")))
            .query(&[("recursive", recursive)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SharingError::Network(format!("revocation failed: {e}")))?;
        check(response).await?;
        Ok(())
    }

    // ── Replication ──────────────────────────────────────────────

    /// Asks a peer which of our revisions it misses.
    pub async fn revs_diff(
        &self,
        instance: &str,
        sharing_id: &SharingId,
        token: &str,
        request: &RevsDiff,
    ) -> SharingResult<RevsDiff> {
        let response = self
            .client
            .post(endpoint(instance, &sharing_path(sharing_id, "/_revs_diff")))
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(|e| SharingError::Network(format!("revs diff failed: {e}")))?;
        let response = check(response).await?;
        response
            .json()
            .await
            .map_err(|e| SharingError::Network(format!("failed to parse revs diff: {e}")))
    }

    /// Pushes documents with their revision chains.
    pub async fn bulk_docs(
        &self,
        instance: &str,
        sharing_id: &SharingId,
        token: &str,
        docs: &BulkDocs,
    ) -> SharingResult<()> {
        let response = self
            .client
            .post(endpoint(instance, &sharing_path(sharing_id, "/_bulk_docs")))
            .bearer_auth(token)
            .json(docs)
            .send()
            .await
            .map_err(|e| SharingError::Network(format!("bulk docs failed: {e}")))?;
        check(response).await?;
        Ok(())
    }

    // ── Files ────────────────────────────────────────────────────

    /// Pushes the metadata of a file; the answer says whether the content
    /// must follow.
    pub async fn put_file_metadata(
        &self,
        instance: &str,
        sharing_id: &SharingId,
        token: &str,
        file: &RevisionedDoc,
    ) -> SharingResult<FileMetadataResponse> {
        let path = format!("/{FILES}/{}/metadata", urlencoding::encode(&file.doc.id));
        let response = self
            .client
            .put(endpoint(instance, &sharing_path(sharing_id, &path)))
            .bearer_auth(token)
            .json(file)
            .send()
            .await
            .map_err(|e| SharingError::Network(format!("file metadata upload failed: {e}")))?;
        let response = check(response).await?;
        response
            .json()
            .await
            .map_err(|e| SharingError::Network(format!("failed to parse metadata response: {e}")))
    }

    /// Uploads the content of a file under the key the peer handed out.
    pub async fn put_file_content(
        &self,
        instance: &str,
        sharing_id: &SharingId,
        token: &str,
        key: &str,
        content: Vec<u8>,
    ) -> SharingResult<()> {
        let path = format!("/{FILES}/{}", urlencoding::encode(key));
        let response = self
            .client
            .put(endpoint(instance, &sharing_path(sharing_id, &path)))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await
            .map_err(|e| SharingError::Network(format!("file upload failed: {e}")))?;
        check(response).await?;
        Ok(())
    }
}

fn endpoint(instance: &str, path: &str) -> String {
    format!("{}{}", instance.trim_end_matches('/'), path)
}

fn sharing_path(sharing_id: &SharingId, suffix: &str) -> String {
    format!("/sharings/{}{}", urlencoding::encode(sharing_id.as_str()), suffix)
}

async fn check(response: Response) -> SharingResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    debug!("Peer responded {}: {}", status, body);
    Err(SharingError::Peer { status, body })
}
