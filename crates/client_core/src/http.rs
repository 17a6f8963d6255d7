use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use shared::{
    domain::{City, Evaluation, EvaluationId, EvaluationPhoto, Report, ReportFile, ReportId, User},
    error::ApiErrorBody,
    protocol::{
        AuthResponse, CreateEvaluationRequest, CreateReportRequest, EvaluationListQuery,
        LoginRequest, PhotoUploadResponse, SignupRequest, UpdateEvaluationRequest,
        UpdateProfileRequest, UpdateReportRequest,
    },
};
use tracing::{debug, warn};

use crate::{
    api::{ApiResult, AuthApi, EvaluationApi, PhotoUpload},
    config::ClientSettings,
    error::ClientError,
    session::Session,
};

pub const REFRESH_TOKEN_HEADER: &str = "X-Refresh-Token";
const PHOTO_FIELD: &str = "photo";

/// The list endpoint answers either with a bare array or wrapped in an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum EvaluationListBody {
    Bare(Vec<Evaluation>),
    Wrapped { evaluations: Vec<Evaluation> },
}

impl From<EvaluationListBody> for Vec<Evaluation> {
    fn from(body: EvaluationListBody) -> Self {
        match body {
            EvaluationListBody::Bare(evaluations)
            | EvaluationListBody::Wrapped { evaluations } => evaluations,
        }
    }
}

#[derive(serde::Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

/// REST client for the evaluation backend. Authenticated calls carry the
/// session's bearer token and go through one refresh-and-retry on 401.
#[derive(Clone)]
pub struct HttpApiClient {
    http: Client,
    base_url: String,
    session: Arc<Session>,
}

impl HttpApiClient {
    pub fn new(settings: &ClientSettings, session: Arc<Session>) -> anyhow::Result<Self> {
        let base_url = settings.normalized_base_url()?;
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            session,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends with the current access token. On 401 the session refreshes once
    /// and the request is rebuilt and retried; a second 401 ends the session.
    async fn send_authorized<F>(&self, build: F) -> ApiResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let token = self
            .session
            .access_token()
            .ok_or(ClientError::NotAuthenticated)?;
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("http: access token rejected, refreshing");
        let token = self.session.refresh_or_teardown(self, &token).await?;
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("http: refreshed access token rejected");
            self.session.expire().await;
            return Err(ClientError::SessionExpired);
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let url = self.url(path);
        decode(self.send_authorized(|http| http.get(&url)).await?).await
    }

    /// `None` when the resource answers 404.
    async fn probe_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<Option<T>> {
        let url = self.url(path);
        let response = self.send_authorized(|http| http.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(path, "http: resource absent");
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn send_json<B, T>(&self, method: reqwest::Method, path: &str, body: &B) -> ApiResult<T>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self
            .send_authorized(|http| http.request(method.clone(), &url).json(body))
            .await?;
        decode(response).await
    }

    async fn post_unauthenticated<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.json::<ApiErrorBody>().await.unwrap_or_default();
        let err = ClientError::from_status(status, &body);
        warn!(status = status.as_u16(), "http: request failed: {err}");
        return Err(err);
    }
    response
        .json::<T>()
        .await
        .map_err(|err| ClientError::InvalidResponse(err.to_string()))
}

#[async_trait]
impl EvaluationApi for HttpApiClient {
    async fn list_evaluations(&self, query: &EvaluationListQuery) -> ApiResult<Vec<Evaluation>> {
        let url = self.url("/evaluations");
        let response = self
            .send_authorized(|http| http.get(&url).query(query))
            .await?;
        decode::<EvaluationListBody>(response).await.map(Into::into)
    }

    async fn create_evaluation(
        &self,
        request: &CreateEvaluationRequest,
    ) -> ApiResult<Evaluation> {
        self.send_json(reqwest::Method::POST, "/evaluations", request)
            .await
    }

    async fn get_evaluation(&self, id: EvaluationId) -> ApiResult<Evaluation> {
        self.get_json(&format!("/evaluations/{id}")).await
    }

    async fn update_evaluation(
        &self,
        id: EvaluationId,
        patch: &UpdateEvaluationRequest,
    ) -> ApiResult<Evaluation> {
        self.send_json(reqwest::Method::PATCH, &format!("/evaluations/{id}"), patch)
            .await
    }

    async fn list_photos(&self, id: EvaluationId) -> ApiResult<Vec<EvaluationPhoto>> {
        self.get_json(&format!("/evaluations/{id}/photos")).await
    }

    async fn upload_photo(
        &self,
        id: EvaluationId,
        upload: &PhotoUpload,
    ) -> ApiResult<PhotoUploadResponse> {
        let url = self.url(&format!("/evaluations/{id}/photos"));
        let response = self
            .send_authorized(|http| {
                // Forms are consumed by send, so each attempt builds its own.
                let part = multipart::Part::bytes(upload.bytes.clone())
                    .file_name(upload.filename.clone());
                let part = match part.mime_str(&upload.content_type) {
                    Ok(part) => part,
                    Err(_) => multipart::Part::bytes(upload.bytes.clone())
                        .file_name(upload.filename.clone()),
                };
                http.post(&url)
                    .multipart(multipart::Form::new().part(PHOTO_FIELD, part))
            })
            .await?;
        decode(response).await
    }

    async fn create_report(&self, request: &CreateReportRequest) -> ApiResult<Report> {
        self.send_json(reqwest::Method::POST, "/reports", request)
            .await
    }

    async fn update_report(
        &self,
        id: ReportId,
        patch: &UpdateReportRequest,
    ) -> ApiResult<Report> {
        self.send_json(reqwest::Method::PATCH, &format!("/reports/{id}"), patch)
            .await
    }

    async fn get_report_by_evaluation(&self, id: EvaluationId) -> ApiResult<Option<Report>> {
        self.probe_json(&format!("/evaluations/{id}/report")).await
    }

    async fn get_report_file(&self, id: ReportId) -> ApiResult<Option<ReportFile>> {
        let file: Option<ReportFile> = self.probe_json(&format!("/reports/{id}/file")).await?;
        Ok(file.filter(|file| !file.url.is_empty()))
    }

    async fn list_cities(&self) -> ApiResult<Vec<City>> {
        self.get_json("/cities").await
    }
}

#[async_trait]
impl AuthApi for HttpApiClient {
    async fn login(&self, request: &LoginRequest) -> ApiResult<AuthResponse> {
        self.post_unauthenticated("/auth/login", request).await
    }

    async fn signup(&self, request: &SignupRequest) -> ApiResult<AuthResponse> {
        self.post_unauthenticated("/auth/signup", request).await
    }

    async fn refresh(&self, refresh_token: &str) -> ApiResult<AuthResponse> {
        let response = self
            .http
            .post(self.url("/auth/refresh"))
            .header(REFRESH_TOKEN_HEADER, refresh_token)
            .json(&RefreshBody { refresh_token })
            .send()
            .await?;
        decode(response).await
    }

    async fn me(&self) -> ApiResult<User> {
        self.get_json("/me").await
    }

    async fn update_me(&self, request: &UpdateProfileRequest) -> ApiResult<User> {
        self.send_json(reqwest::Method::PUT, "/me", request).await
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
