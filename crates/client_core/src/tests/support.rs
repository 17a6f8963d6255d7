use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use shared::{
    domain::{
        City, CityId, Evaluation, EvaluationId, EvaluationPhoto, EvaluationStatus, PhotoId,
        Report, ReportFile, ReportId, ReportStatus, Role, User, UserId,
    },
    protocol::{
        AuthResponse, CreateEvaluationRequest, CreateReportRequest, EvaluationListQuery,
        PhotoUploadResponse, UpdateEvaluationRequest, UpdateReportRequest,
    },
};
use tokio::sync::Notify;

use crate::{
    api::{ApiResult, EvaluationApi, PhotoUpload},
    error::ClientError,
    lifecycle::Actor,
    session::Session,
};

pub(crate) const REQUESTER: UserId = UserId(3);

pub(crate) fn evaluation(
    id: i64,
    status: EvaluationStatus,
    evaluator_id: Option<i64>,
) -> Evaluation {
    Evaluation {
        id: EvaluationId(id),
        status,
        requester_id: REQUESTER,
        evaluator_id: evaluator_id.map(UserId),
        city_id: Some(CityId(2)),
        vehicle_make: "Fiat".to_string(),
        vehicle_model: "Uno".to_string(),
        vehicle_plate: "ABC1D23".to_string(),
        vehicle_year: Some(2012),
        notes: "check brakes".to_string(),
        created_at: None,
        updated_at: None,
        photos: Vec::new(),
        report: None,
    }
}

pub(crate) fn report(id: i64, evaluation_id: i64, status: ReportStatus, summary: &str) -> Report {
    Report {
        id: ReportId(id),
        evaluation_id: EvaluationId(evaluation_id),
        evaluator_id: Some(UserId(9)),
        summary: summary.to_string(),
        status,
        file_url: None,
        created_at: None,
        updated_at: None,
    }
}

pub(crate) fn user(id: i64, role: Role) -> User {
    User {
        id: UserId(id),
        full_name: format!("User {id}"),
        email: format!("user{id}@example.com"),
        phone: "11999999999".to_string(),
        role,
        is_active: true,
        created_at: None,
        updated_at: None,
    }
}

pub(crate) fn evaluator(id: i64) -> Actor {
    Actor {
        id: UserId(id),
        role: Role::Evaluator,
    }
}

pub(crate) fn requester() -> Actor {
    Actor {
        id: REQUESTER,
        role: Role::User,
    }
}

pub(crate) fn auth_response(user: User, access_token: &str, refresh_token: &str) -> AuthResponse {
    AuthResponse {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.to_string(),
        user,
    }
}

pub(crate) async fn signed_in(user: User) -> Arc<Session> {
    let session = Session::in_memory();
    session
        .establish(auth_response(user, "access-1", "refresh-1"))
        .await;
    session
}

/// In-memory stand-in for the backend. It enforces the same ownership rules
/// the real server does and records every call.
#[derive(Default)]
pub(crate) struct FakeEvaluationApi {
    pub evaluations: Mutex<HashMap<EvaluationId, Evaluation>>,
    pub reports: Mutex<HashMap<EvaluationId, Report>>,
    pub report_files: Mutex<HashMap<ReportId, ReportFile>>,
    pub photos: Mutex<Vec<EvaluationPhoto>>,
    pub evaluation_patches: Mutex<Vec<UpdateEvaluationRequest>>,
    pub report_patches: Mutex<Vec<UpdateReportRequest>>,
    calls: Mutex<Vec<&'static str>>,
    pub fail_reads: AtomicBool,
    pub fail_updates: AtomicBool,
    pub hold_updates: AtomicBool,
    pub update_started: Notify,
    pub release_update: Notify,
    pub hold_lookups: AtomicBool,
    pub lookup_started: Notify,
    pub release_lookup: Notify,
}

impl FakeEvaluationApi {
    pub(crate) fn with_evaluation(evaluation: Evaluation) -> Arc<Self> {
        let fake = Self::default();
        fake.put_evaluation(evaluation);
        Arc::new(fake)
    }

    pub(crate) fn put_evaluation(&self, evaluation: Evaluation) {
        self.evaluations
            .lock()
            .expect("evaluations lock")
            .insert(evaluation.id, evaluation);
    }

    pub(crate) fn put_report(&self, report: Report) {
        self.reports
            .lock()
            .expect("reports lock")
            .insert(report.evaluation_id, report);
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|made| **made == call).count()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn read_guard(&self) -> ApiResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ClientError::Transient("connection refused".to_string()));
        }
        Ok(())
    }

    fn conflict(message: &str) -> ClientError {
        ClientError::Conflict {
            status: 409,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl EvaluationApi for FakeEvaluationApi {
    async fn list_evaluations(&self, query: &EvaluationListQuery) -> ApiResult<Vec<Evaluation>> {
        self.record("list_evaluations");
        self.read_guard()?;
        let mut evaluations: Vec<Evaluation> = self
            .evaluations
            .lock()
            .expect("evaluations lock")
            .values()
            .filter(|evaluation| query.status.map_or(true, |status| evaluation.status == status))
            .cloned()
            .collect();
        evaluations.sort_by_key(|evaluation| evaluation.id);
        Ok(evaluations)
    }

    async fn create_evaluation(
        &self,
        request: &CreateEvaluationRequest,
    ) -> ApiResult<Evaluation> {
        self.record("create_evaluation");
        let mut evaluations = self.evaluations.lock().expect("evaluations lock");
        let next_id = evaluations.keys().map(|id| id.0).max().unwrap_or(0) + 1;
        let mut created = evaluation(next_id, EvaluationStatus::Created, None);
        created.city_id = Some(request.city_id);
        created.vehicle_make = request.vehicle_make.clone();
        created.vehicle_model = request.vehicle_model.clone();
        created.vehicle_plate = request.vehicle_plate.clone();
        created.vehicle_year = Some(request.vehicle_year);
        created.notes = request.notes.clone();
        evaluations.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_evaluation(&self, id: EvaluationId) -> ApiResult<Evaluation> {
        self.record("get_evaluation");
        self.read_guard()?;
        self.evaluations
            .lock()
            .expect("evaluations lock")
            .get(&id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound {
                what: format!("evaluation {id}"),
            })
    }

    async fn update_evaluation(
        &self,
        id: EvaluationId,
        patch: &UpdateEvaluationRequest,
    ) -> ApiResult<Evaluation> {
        self.record("update_evaluation");
        self.evaluation_patches
            .lock()
            .expect("patches lock")
            .push(patch.clone());
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(ClientError::Transient("connection reset".to_string()));
        }
        if self.hold_updates.load(Ordering::SeqCst) {
            self.update_started.notify_one();
            self.release_update.notified().await;
        }

        let mut evaluations = self.evaluations.lock().expect("evaluations lock");
        let evaluation = evaluations
            .get_mut(&id)
            .ok_or_else(|| ClientError::NotFound {
                what: format!("evaluation {id}"),
            })?;
        if let Some(evaluator_id) = patch.evaluator_id {
            if evaluation.evaluator_id.is_some() {
                return Err(Self::conflict("evaluation already accepted"));
            }
            evaluation.evaluator_id = Some(evaluator_id);
            evaluation.status = EvaluationStatus::Accepted;
        }
        if let Some(status) = patch.status {
            if evaluation.status.is_terminal() {
                return Err(Self::conflict("evaluation is closed"));
            }
            evaluation.status = status;
        }
        Ok(evaluation.clone())
    }

    async fn list_photos(&self, id: EvaluationId) -> ApiResult<Vec<EvaluationPhoto>> {
        self.record("list_photos");
        self.read_guard()?;
        Ok(self
            .photos
            .lock()
            .expect("photos lock")
            .iter()
            .filter(|photo| photo.evaluation_id == id)
            .cloned()
            .collect())
    }

    async fn upload_photo(
        &self,
        id: EvaluationId,
        upload: &PhotoUpload,
    ) -> ApiResult<PhotoUploadResponse> {
        self.record("upload_photo");
        let mut photos = self.photos.lock().expect("photos lock");
        let url = format!("https://cdn.example/{}", upload.filename);
        let photo_id = PhotoId(photos.len() as i64 + 1);
        photos.push(EvaluationPhoto {
            id: photo_id,
            evaluation_id: id,
            url: url.clone(),
            content_type: Some(upload.content_type.clone()),
            size_bytes: Some(upload.bytes.len() as u64),
            created_at: None,
        });
        Ok(PhotoUploadResponse {
            photo_url: Some(url),
            presigned_url: None,
        })
    }

    async fn create_report(&self, request: &CreateReportRequest) -> ApiResult<Report> {
        self.record("create_report");
        let mut reports = self.reports.lock().expect("reports lock");
        if reports.contains_key(&request.evaluation_id) {
            return Err(Self::conflict("report already exists"));
        }
        let created = report(50, request.evaluation_id.0, ReportStatus::Draft, &request.summary);
        reports.insert(request.evaluation_id, created.clone());
        Ok(created)
    }

    async fn update_report(
        &self,
        id: ReportId,
        patch: &UpdateReportRequest,
    ) -> ApiResult<Report> {
        self.record("update_report");
        self.report_patches
            .lock()
            .expect("patches lock")
            .push(patch.clone());
        let mut reports = self.reports.lock().expect("reports lock");
        let report = reports
            .values_mut()
            .find(|report| report.id == id)
            .ok_or_else(|| ClientError::NotFound {
                what: format!("report {id}"),
            })?;
        if !report.is_draft() {
            return Err(Self::conflict("report is finalized"));
        }
        if let Some(summary) = &patch.summary {
            report.summary = summary.clone();
        }
        if let Some(status) = patch.status {
            report.status = status;
        }
        Ok(report.clone())
    }

    async fn get_report_by_evaluation(&self, id: EvaluationId) -> ApiResult<Option<Report>> {
        self.record("get_report_by_evaluation");
        self.read_guard()?;
        if self.hold_lookups.load(Ordering::SeqCst) {
            self.lookup_started.notify_one();
            self.release_lookup.notified().await;
        }
        Ok(self.reports.lock().expect("reports lock").get(&id).cloned())
    }

    async fn get_report_file(&self, id: ReportId) -> ApiResult<Option<ReportFile>> {
        self.record("get_report_file");
        self.read_guard()?;
        Ok(self
            .report_files
            .lock()
            .expect("files lock")
            .get(&id)
            .cloned())
    }

    async fn list_cities(&self) -> ApiResult<Vec<City>> {
        self.record("list_cities");
        Ok(vec![City {
            id: CityId(2),
            name: "Campinas".to_string(),
            state: "SP".to_string(),
            country: "BR".to_string(),
        }])
    }
}
