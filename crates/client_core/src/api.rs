use async_trait::async_trait;
use shared::{
    domain::{City, Evaluation, EvaluationId, EvaluationPhoto, Report, ReportFile, ReportId, User},
    protocol::{
        AuthResponse, CreateEvaluationRequest, CreateReportRequest, EvaluationListQuery,
        LoginRequest, PhotoUploadResponse, SignupRequest, UpdateEvaluationRequest,
        UpdateProfileRequest, UpdateReportRequest,
    },
};

use crate::error::ClientError;

pub type ApiResult<T> = std::result::Result<T, ClientError>;

/// A photo selected for upload.
#[derive(Debug, Clone)]
pub struct PhotoUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Evaluation, photo and report endpoints. Optional lookups return `None` for
/// "does not exist yet" instead of an error.
#[async_trait]
pub trait EvaluationApi: Send + Sync {
    async fn list_evaluations(&self, query: &EvaluationListQuery) -> ApiResult<Vec<Evaluation>>;
    async fn create_evaluation(&self, request: &CreateEvaluationRequest)
        -> ApiResult<Evaluation>;
    async fn get_evaluation(&self, id: EvaluationId) -> ApiResult<Evaluation>;
    async fn update_evaluation(
        &self,
        id: EvaluationId,
        patch: &UpdateEvaluationRequest,
    ) -> ApiResult<Evaluation>;
    async fn list_photos(&self, id: EvaluationId) -> ApiResult<Vec<EvaluationPhoto>>;
    async fn upload_photo(
        &self,
        id: EvaluationId,
        upload: &PhotoUpload,
    ) -> ApiResult<PhotoUploadResponse>;
    async fn create_report(&self, request: &CreateReportRequest) -> ApiResult<Report>;
    async fn update_report(&self, id: ReportId, patch: &UpdateReportRequest)
        -> ApiResult<Report>;
    async fn get_report_by_evaluation(&self, id: EvaluationId) -> ApiResult<Option<Report>>;
    async fn get_report_file(&self, id: ReportId) -> ApiResult<Option<ReportFile>>;
    async fn list_cities(&self) -> ApiResult<Vec<City>>;
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> ApiResult<AuthResponse>;
    async fn signup(&self, request: &SignupRequest) -> ApiResult<AuthResponse>;
    async fn refresh(&self, refresh_token: &str) -> ApiResult<AuthResponse>;
    async fn me(&self) -> ApiResult<User>;
    async fn update_me(&self, request: &UpdateProfileRequest) -> ApiResult<User>;
}
