//! Google Drive v3 REST backend.
//!
//! Every request carries the current bearer token. A 401 answer triggers one
//! refresh-token grant and one retry of the same request; the refreshed
//! tokens are readable through [`GoogleDriveBackend::tokens`] so the caller
//! can persist them.

use crate::{CloudError, DriveBackend, FilePage, FileQuery, RemoteFile, FOLDER_MIME_TYPE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthUrl, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const FILE_FIELDS: &str = "id,name,mimeType,parents,createdTime,modifiedTime,trashed";

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// OAuth client registration as found in a Google credentials file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Deserialize)]
struct CredentialsFile {
    installed: Option<OAuthClientSecrets>,
    web: Option<OAuthClientSecrets>,
}

impl OAuthClientSecrets {
    /// Accepts both the "installed" (desktop) and "web" client shapes.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: CredentialsFile = serde_json::from_str(raw)
            .map_err(|e| CloudError::InvalidCredentials(e.to_string()))?;
        let secrets = file.installed.or(file.web).ok_or_else(|| {
            CloudError::InvalidCredentials("expected an `installed` or `web` section".into())
        })?;
        Ok(secrets)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
        Self::from_json(&raw)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct AboutResponse {
    user: AboutUser,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutUser {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    email_address: Option<String>,
}

pub struct GoogleDriveBackend {
    client: Client,
    api_base: String,
    upload_base: String,
    secrets: Option<OAuthClientSecrets>,
    tokens: RwLock<DriveTokens>,
}

impl GoogleDriveBackend {
    pub fn new(secrets: Option<OAuthClientSecrets>, tokens: DriveTokens) -> Self {
        Self {
            client: Client::new(),
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
            secrets,
            tokens: RwLock::new(tokens),
        }
    }

    /// Point the backend at another host, e.g. a local mock server.
    pub fn with_base_urls(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    pub async fn tokens(&self) -> DriveTokens {
        self.tokens.read().await.clone()
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base, urlencoding::encode(id))
    }

    async fn refresh(&self) -> Result<()> {
        let secrets = self.secrets.as_ref().ok_or(CloudError::NotAuthenticated)?;
        let refresh_token = self
            .tokens
            .read()
            .await
            .refresh_token
            .clone()
            .ok_or(CloudError::NotAuthenticated)?;

        let auth_url = AuthUrl::new(secrets.auth_uri.clone())
            .map_err(|e| CloudError::InvalidCredentials(e.to_string()))?;
        let token_url = TokenUrl::new(secrets.token_uri.clone())
            .map_err(|e| CloudError::InvalidCredentials(e.to_string()))?;
        let client = BasicClient::new(
            ClientId::new(secrets.client_id.clone()),
            Some(ClientSecret::new(secrets.client_secret.clone())),
            auth_url,
            Some(token_url),
        );

        log::info!("[GoogleDrive] Access token rejected, refreshing");
        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token))
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                log::warn!("[GoogleDrive] Token refresh failed: {}", e);
                CloudError::NotAuthenticated
            })?;

        let mut tokens = self.tokens.write().await;
        tokens.access_token = response.access_token().secret().clone();
        if let Some(rotated) = response.refresh_token() {
            tokens.refresh_token = Some(rotated.secret().clone());
        }
        Ok(())
    }

    /// Send with the current token; on 401 refresh once and resend.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.tokens.read().await.access_token.clone();
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        self.refresh().await?;
        let token = self.tokens.read().await.access_token.clone();
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(CloudError::NotAuthenticated.into());
        }
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    log::debug!("[GoogleDrive] HTTP {}: {}", status, body);
    Err(CloudError::Api {
        status: status.as_u16(),
        body,
    }
    .into())
}

#[async_trait]
impl DriveBackend for GoogleDriveBackend {
    async fn list(&self, query: &FileQuery, page_token: Option<&str>) -> Result<FilePage> {
        let url = format!("{}/files", self.api_base);
        let mut params = vec![
            ("q".to_string(), query.to_drive_q()),
            ("fields".to_string(), format!("nextPageToken,files({FILE_FIELDS})")),
            ("pageSize".to_string(), query.page_size.to_string()),
            ("spaces".to_string(), "drive".to_string()),
        ];
        if let Some(order) = query.order_by.as_param() {
            params.push(("orderBy".to_string(), order.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken".to_string(), token.to_string()));
        }

        let response = self.send(|c| c.get(&url).query(&params)).await?;
        let page = response.json::<FilePage>().await?;
        Ok(page)
    }

    async fn get(&self, id: &str) -> Result<Option<RemoteFile>> {
        let url = self.file_url(id);
        match self.send(|c| c.get(&url).query(&[("fields", FILE_FIELDS)])).await {
            Ok(response) => Ok(Some(response.json::<RemoteFile>().await?)),
            Err(e) if CloudError::is_status(&e, 404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteFile> {
        let url = format!("{}/files", self.api_base);
        let body = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent],
        });
        let response = self
            .send(|c| c.post(&url).query(&[("fields", FILE_FIELDS)]).json(&body))
            .await?;
        Ok(response.json::<RemoteFile>().await?)
    }

    async fn upload_file(&self, parent: &str, name: &str, local_path: &Path) -> Result<RemoteFile> {
        let data = Bytes::from(
            tokio::fs::read(local_path)
                .await
                .with_context(|| format!("Failed to read {}", local_path.display()))?,
        );

        // Metadata first, then the content against the new id.
        let url = format!("{}/files", self.api_base);
        let body = serde_json::json!({ "name": name, "parents": [parent] });
        let created = self
            .send(|c| c.post(&url).query(&[("fields", "id")]).json(&body))
            .await?
            .json::<RemoteFile>()
            .await?;

        let media_url = format!("{}/files/{}", self.upload_base, urlencoding::encode(&created.id));
        let uploaded = self
            .send(|c| {
                c.patch(&media_url)
                    .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await;
        let response = match uploaded {
            Ok(response) => response,
            Err(e) => {
                // Do not leave an empty file behind.
                if let Err(cleanup) = self.delete(&created.id).await {
                    log::warn!("[GoogleDrive] Could not remove partial upload {}: {}", created.id, cleanup);
                }
                return Err(e);
            }
        };
        log::debug!("[GoogleDrive] Uploaded {} ({} bytes)", name, data.len());
        Ok(response.json::<RemoteFile>().await?)
    }

    async fn download_file(&self, id: &str, dest: &Path) -> Result<()> {
        let url = self.file_url(id);
        let response = self.send(|c| c.get(&url).query(&[("alt", "media")])).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let url = self.file_url(id);
        self.send(|c| c.delete(&url)).await?;
        Ok(())
    }

    async fn trash(&self, id: &str) -> Result<()> {
        let url = self.file_url(id);
        let body = serde_json::json!({ "trashed": true });
        self.send(|c| c.patch(&url).json(&body)).await?;
        Ok(())
    }

    async fn about(&self) -> Result<String> {
        let url = format!("{}/about", self.api_base);
        let about = self
            .send(|c| c.get(&url).query(&[("fields", "user")]))
            .await?
            .json::<AboutResponse>()
            .await?;
        Ok(about
            .user
            .display_name
            .or(about.user.email_address)
            .unwrap_or_default())
    }
}
