//! Per-screen controller for one evaluation.
//!
//! The controller owns the last-known snapshot of the evaluation, its report
//! and its photos. Every action is checked against [`crate::lifecycle`] before
//! any request leaves, at most one mutation runs at a time, and every success
//! replaces the affected entity with what the server returned.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use shared::{
    domain::{Evaluation, EvaluationId, EvaluationPhoto, EvaluationStatus, Report},
    protocol::{CreateReportRequest, UpdateEvaluationRequest, UpdateReportRequest},
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    api::{ApiResult, EvaluationApi, PhotoUpload},
    error::ClientError,
    lifecycle::{self, Action, Actor, Denial, ReportSlot},
    notices::{NoticeKind, NoticeQueue},
    session::{Session, SessionEvent},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFileStatus {
    Available { url: String },
    /// The report exists but its rendered file has not been produced yet.
    NotYetAvailable,
}

/// What a presentation layer needs to draw the evaluation screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationView {
    pub evaluation: Evaluation,
    pub report: ReportSlot,
    pub photos: Vec<EvaluationPhoto>,
    pub allowed_actions: Vec<Action>,
    pub in_flight: Option<Action>,
    pub stale: bool,
}

#[derive(Debug, Default)]
struct ControllerState {
    evaluation: Option<Evaluation>,
    report: ReportSlot,
    photos: Vec<EvaluationPhoto>,
    in_flight: Option<Action>,
    stale: bool,
    /// Bumped by `detach`; responses from an older epoch are dropped.
    epoch: u64,
    /// Bumped whenever a mutation lands; a refresh that started before it is
    /// older than the snapshot and is dropped.
    revision: u64,
}

impl ControllerState {
    fn permitted(&self, actor: Option<Actor>) -> Vec<Action> {
        let (Some(actor), Some(evaluation)) = (actor, self.evaluation.as_ref()) else {
            return Vec::new();
        };
        if self.stale {
            return Vec::new();
        }
        lifecycle::allowed_actions(&actor, evaluation, &self.report)
            .into_iter()
            .filter(|action| self.in_flight.is_none() || !is_mutation(*action))
            .collect()
    }

    fn gate(&self, action: Action, actor: &Actor) -> Result<&Evaluation, Denial> {
        if is_mutation(action) {
            if let Some(running) = self.in_flight {
                debug!(running = ?running, requested = ?action, "lifecycle: mutation already running");
                return Err(Denial::ActionInFlight);
            }
        }
        if self.stale {
            return Err(Denial::StaleState);
        }
        let evaluation = self.evaluation.as_ref().ok_or(Denial::NotLoaded)?;
        lifecycle::check(action, actor, evaluation, &self.report)?;
        Ok(evaluation)
    }
}

fn is_mutation(action: Action) -> bool {
    action != Action::ViewReport
}

fn success_message(action: Action) -> &'static str {
    match action {
        Action::Accept => "Evaluation accepted",
        Action::Start => "Evaluation started",
        Action::Complete => "Evaluation completed",
        Action::Cancel => "Evaluation canceled",
        Action::CreateReport => "Report created",
        Action::UpdateReport => "Report saved",
        Action::FinalizeReport => "Report finalized",
        Action::AddPhoto => "Photo added",
        Action::ViewReport => "Report opened",
    }
}

/// Marks one mutation as running. Dropping it frees the slot, unless the
/// controller was detached in the meantime.
struct InFlight<'a> {
    controller: &'a EvaluationController,
    epoch: u64,
    action: Action,
    actor: Actor,
    evaluation: Evaluation,
    report: ReportSlot,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.controller.lock();
        if state.epoch == self.epoch && state.in_flight == Some(self.action) {
            state.in_flight = None;
        }
    }
}

pub struct EvaluationController {
    api: Arc<dyn EvaluationApi>,
    session: Arc<Session>,
    notices: Arc<NoticeQueue>,
    evaluation_id: EvaluationId,
    inner: Mutex<ControllerState>,
}

impl EvaluationController {
    pub fn new(
        api: Arc<dyn EvaluationApi>,
        session: Arc<Session>,
        notices: Arc<NoticeQueue>,
        evaluation_id: EvaluationId,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            session,
            notices,
            evaluation_id,
            inner: Mutex::new(ControllerState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Option<EvaluationView> {
        let actor = self.session.actor();
        let state = self.lock();
        let evaluation = state.evaluation.clone()?;
        Some(EvaluationView {
            evaluation,
            report: state.report.clone(),
            photos: state.photos.clone(),
            allowed_actions: state.permitted(actor),
            in_flight: state.in_flight,
            stale: state.stale,
        })
    }

    pub fn allowed_actions(&self) -> Vec<Action> {
        let actor = self.session.actor();
        self.lock().permitted(actor)
    }

    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }

    /// Stops this controller from applying anything still on the wire.
    pub fn detach(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.in_flight = None;
        debug!(evaluation_id = self.evaluation_id.0, epoch = state.epoch, "lifecycle: detached");
    }

    /// Detaches and forgets the snapshot.
    pub fn clear(&self) {
        let mut state = self.lock();
        let epoch = state.epoch + 1;
        *state = ControllerState {
            epoch,
            ..ControllerState::default()
        };
    }

    /// Clears the snapshot whenever the session ends.
    pub fn watch_session(self: &Arc<Self>) -> JoinHandle<()> {
        let controller: Weak<Self> = Arc::downgrade(self);
        let mut events = self.session.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Ended(reason)) => {
                        let Some(controller) = controller.upgrade() else {
                            break;
                        };
                        debug!(
                            evaluation_id = controller.evaluation_id.0,
                            reason = ?reason,
                            "lifecycle: session ended, clearing evaluation"
                        );
                        controller.clear();
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Re-reads the evaluation, its photos and its report from the server.
    pub async fn refresh(&self) -> Result<EvaluationView, ClientError> {
        let (epoch, revision) = {
            let state = self.lock();
            (state.epoch, state.revision)
        };

        match self.fetch(epoch).await {
            Ok((evaluation, photos, report)) => self.install(epoch, revision, evaluation, photos, report),
            Err(err) => {
                self.notify_failure(&err);
                Err(err)
            }
        }
    }

    async fn fetch(
        &self,
        epoch: u64,
    ) -> Result<(Evaluation, Vec<EvaluationPhoto>, ReportSlot), ClientError> {
        let id = self.evaluation_id;
        let evaluation = self.current(epoch, self.api.get_evaluation(id).await)?;
        self.verify_evaluation(&evaluation)?;

        let photos = if evaluation.photos.is_empty() {
            self.current(epoch, self.api.list_photos(id).await)?
        } else {
            evaluation.photos.clone()
        };

        let report = match (&evaluation.report, evaluation.status) {
            (Some(report), _) => ReportSlot::Present(report.clone()),
            // Reports only exist once work is underway; look them up when needed.
            (None, EvaluationStatus::Created | EvaluationStatus::Accepted) => ReportSlot::Unknown,
            (None, _) => {
                let probed = self.current(epoch, self.api.get_report_by_evaluation(id).await)?;
                if probed.is_none() {
                    debug!(evaluation_id = id.0, "lifecycle: no report yet");
                }
                ReportSlot::from(probed)
            }
        };
        Ok((evaluation, photos, report))
    }

    fn install(
        &self,
        epoch: u64,
        revision: u64,
        evaluation: Evaluation,
        photos: Vec<EvaluationPhoto>,
        report: ReportSlot,
    ) -> Result<EvaluationView, ClientError> {
        let actor = self.session.actor();
        let mut state = self.lock();
        if state.epoch != epoch {
            debug!(evaluation_id = self.evaluation_id.0, "lifecycle: discarding refresh after detach");
            return Err(ClientError::Detached);
        }
        if state.revision == revision {
            let next = match (state.report.report(), report) {
                (Some(known), ReportSlot::Present(incoming)) if regresses(known, &incoming) => {
                    warn!(
                        evaluation_id = self.evaluation_id.0,
                        report_id = known.id.0,
                        "lifecycle: server returned finalized report as draft, keeping finalized"
                    );
                    state.report.clone()
                }
                (_, report) => report,
            };
            state.report = next;
            state.evaluation = Some(evaluation);
            state.photos = photos;
            state.stale = false;
            info!(evaluation_id = self.evaluation_id.0, "lifecycle: refreshed");
        } else {
            debug!(
                evaluation_id = self.evaluation_id.0,
                "lifecycle: refresh overtaken by a newer mutation"
            );
        }

        let evaluation = state.evaluation.clone().ok_or(ClientError::Detached)?;
        Ok(EvaluationView {
            evaluation,
            report: state.report.clone(),
            photos: state.photos.clone(),
            allowed_actions: state.permitted(actor),
            in_flight: state.in_flight,
            stale: state.stale,
        })
    }

    pub async fn accept(&self) -> Result<Evaluation, ClientError> {
        let flight = self.begin(Action::Accept)?;
        let patch = UpdateEvaluationRequest::assign(flight.actor.id);
        self.update_evaluation(flight, patch).await
    }

    pub async fn start(&self) -> Result<Evaluation, ClientError> {
        let flight = self.begin(Action::Start)?;
        self.update_evaluation(flight, UpdateEvaluationRequest::transition(EvaluationStatus::InProgress))
            .await
    }

    pub async fn complete(&self) -> Result<Evaluation, ClientError> {
        let flight = self.begin(Action::Complete)?;
        self.update_evaluation(flight, UpdateEvaluationRequest::transition(EvaluationStatus::Completed))
            .await
    }

    pub async fn cancel(&self) -> Result<Evaluation, ClientError> {
        let flight = self.begin(Action::Cancel)?;
        self.update_evaluation(flight, UpdateEvaluationRequest::transition(EvaluationStatus::Canceled))
            .await
    }

    async fn update_evaluation(
        &self,
        flight: InFlight<'_>,
        patch: UpdateEvaluationRequest,
    ) -> Result<Evaluation, ClientError> {
        info!(
            evaluation_id = self.evaluation_id.0,
            action = ?flight.action,
            from = %flight.evaluation.status,
            "lifecycle: sending transition"
        );
        let result = self.api.update_evaluation(self.evaluation_id, &patch).await;
        let evaluation = self.settle(&flight, result).await?;
        self.commit_evaluation(&flight, evaluation)
    }

    fn commit_evaluation(
        &self,
        flight: &InFlight<'_>,
        evaluation: Evaluation,
    ) -> Result<Evaluation, ClientError> {
        if let Err(err) = self.verify_evaluation(&evaluation) {
            self.notify_failure(&err);
            return Err(err);
        }

        {
            let mut state = self.lock();
            if state.epoch != flight.epoch {
                return Err(self.discarded(flight.action));
            }
            if let Some(incoming) = evaluation.report.clone() {
                let keep_finalized = state
                    .report
                    .report()
                    .is_some_and(|known| regresses(known, &incoming));
                if keep_finalized {
                    warn!(
                        evaluation_id = self.evaluation_id.0,
                        report_id = incoming.id.0,
                        "lifecycle: transition returned finalized report as draft, keeping finalized"
                    );
                } else {
                    state.report = ReportSlot::Present(incoming);
                }
            }
            if !evaluation.photos.is_empty() {
                state.photos = evaluation.photos.clone();
            }
            state.evaluation = Some(evaluation.clone());
            state.revision += 1;
        }

        info!(
            evaluation_id = self.evaluation_id.0,
            action = ?flight.action,
            status = %evaluation.status,
            "lifecycle: transition applied"
        );
        self.notices.push(NoticeKind::Success, success_message(flight.action));
        Ok(evaluation)
    }

    pub async fn create_report(&self, summary: &str) -> Result<Report, ClientError> {
        let flight = self.begin(Action::CreateReport)?;

        if !flight.report.is_known() {
            let probed = self
                .api
                .get_report_by_evaluation(self.evaluation_id)
                .await;
            let probed = self.settle(&flight, probed).await?;
            match probed {
                Some(existing) => {
                    self.commit_report(&flight, existing, false)?;
                    return Err(self.deny(Action::CreateReport, Denial::ReportExists));
                }
                None => {
                    let mut state = self.lock();
                    if state.epoch != flight.epoch {
                        return Err(self.discarded(flight.action));
                    }
                    state.report = ReportSlot::Absent;
                }
            }
        }

        let request = CreateReportRequest {
            evaluation_id: self.evaluation_id,
            summary: summary.trim().to_string(),
        };
        let result = self.api.create_report(&request).await;
        let report = self.settle(&flight, result).await?;
        self.commit_report(&flight, report, true)
    }

    pub async fn update_report(&self, summary: &str) -> Result<Report, ClientError> {
        let flight = self.begin(Action::UpdateReport)?;
        let report_id = flight.report.report().map(|report| report.id).ok_or_else(|| {
            self.deny(Action::UpdateReport, Denial::ReportMissing)
        })?;
        let result = self
            .api
            .update_report(report_id, &UpdateReportRequest::summary(summary.trim()))
            .await;
        let report = self.settle(&flight, result).await?;
        self.commit_report(&flight, report, true)
    }

    /// Irreversible: a finalized report is never edited again.
    pub async fn finalize_report(&self) -> Result<Report, ClientError> {
        let flight = self.begin(Action::FinalizeReport)?;
        let report_id = flight.report.report().map(|report| report.id).ok_or_else(|| {
            self.deny(Action::FinalizeReport, Denial::ReportMissing)
        })?;
        let result = self
            .api
            .update_report(report_id, &UpdateReportRequest::finalize())
            .await;
        let report = self.settle(&flight, result).await?;
        self.commit_report(&flight, report, true)
    }

    fn commit_report(
        &self,
        flight: &InFlight<'_>,
        report: Report,
        announce: bool,
    ) -> Result<Report, ClientError> {
        let verdict = {
            let mut state = self.lock();
            if state.epoch != flight.epoch {
                return Err(self.discarded(flight.action));
            }
            if report.evaluation_id != self.evaluation_id {
                Err(ClientError::InvalidResponse(format!(
                    "report {} belongs to evaluation {}, expected {}",
                    report.id, report.evaluation_id, self.evaluation_id
                )))
            } else if state
                .report
                .report()
                .is_some_and(|known| regresses(known, &report))
            {
                Err(ClientError::InvalidResponse(format!(
                    "report {} is finalized but came back as draft",
                    report.id
                )))
            } else {
                state.report = ReportSlot::Present(report.clone());
                state.revision += 1;
                Ok(())
            }
        };

        if let Err(err) = verdict {
            self.notify_failure(&err);
            return Err(err);
        }

        info!(
            evaluation_id = self.evaluation_id.0,
            report_id = report.id.0,
            status = %report.status,
            "lifecycle: report applied"
        );
        if announce {
            self.notices.push(NoticeKind::Success, success_message(flight.action));
        }
        Ok(report)
    }

    /// Resolves the report's file. Not gated on other running mutations.
    pub async fn view_report(&self) -> Result<ReportFileStatus, ClientError> {
        let actor = self.require_actor()?;
        let gated = {
            let state = self.lock();
            let gated = state
                .gate(Action::ViewReport, &actor)
                .map(|_| (state.epoch, state.report.report().map(|report| report.id)));
            gated
        };
        let (epoch, report_id) = gated.map_err(|denial| self.deny(Action::ViewReport, denial))?;
        let report_id =
            report_id.ok_or_else(|| self.deny(Action::ViewReport, Denial::ReportMissing))?;

        let file = match self.current(epoch, self.api.get_report_file(report_id).await) {
            Ok(file) => file,
            Err(err) => {
                self.notify_failure(&err);
                return Err(err);
            }
        };
        Ok(match file {
            Some(file) => ReportFileStatus::Available { url: file.url },
            None => {
                debug!(report_id = report_id.0, "lifecycle: report file not produced yet");
                self.notices
                    .push(NoticeKind::Info, "The report file is not available yet");
                ReportFileStatus::NotYetAvailable
            }
        })
    }

    pub async fn refresh_photos(&self) -> Result<Vec<EvaluationPhoto>, ClientError> {
        let epoch = self.lock().epoch;
        let photos = match self.current(epoch, self.api.list_photos(self.evaluation_id).await) {
            Ok(photos) => photos,
            Err(err) => {
                self.notify_failure(&err);
                return Err(err);
            }
        };
        let mut state = self.lock();
        if state.epoch != epoch {
            return Err(ClientError::Detached);
        }
        state.photos = photos.clone();
        Ok(photos)
    }

    /// Uploads one photo, then re-reads the list the server now holds.
    pub async fn add_photo(&self, upload: PhotoUpload) -> Result<Vec<EvaluationPhoto>, ClientError> {
        let flight = self.begin(Action::AddPhoto)?;
        info!(
            evaluation_id = self.evaluation_id.0,
            filename = %upload.filename,
            size_bytes = upload.bytes.len(),
            "lifecycle: uploading photo"
        );
        let uploaded = self.api.upload_photo(self.evaluation_id, &upload).await;
        self.settle(&flight, uploaded).await?;

        let listed = self.api.list_photos(self.evaluation_id).await;
        let photos = self.settle(&flight, listed).await?;
        {
            let mut state = self.lock();
            if state.epoch != flight.epoch {
                return Err(self.discarded(flight.action));
            }
            state.photos = photos.clone();
            state.revision += 1;
        }
        self.notices
            .push(NoticeKind::Success, success_message(Action::AddPhoto));
        Ok(photos)
    }

    fn require_actor(&self) -> Result<Actor, ClientError> {
        self.session.actor().ok_or_else(|| {
            let err = ClientError::NotAuthenticated;
            self.notify_failure(&err);
            err
        })
    }

    /// Runs every local rule for `action` and claims the mutation slot.
    fn begin(&self, action: Action) -> Result<InFlight<'_>, ClientError> {
        let actor = self.require_actor()?;
        let claimed = {
            let mut state = self.lock();
            let gated = state.gate(action, &actor).map(Evaluation::clone);
            match gated {
                Ok(evaluation) => {
                    state.in_flight = Some(action);
                    Ok((state.epoch, evaluation, state.report.clone()))
                }
                Err(denial) => Err(denial),
            }
        };

        let (epoch, evaluation, report) = claimed.map_err(|denial| self.deny(action, denial))?;
        Ok(InFlight {
            controller: self,
            epoch,
            action,
            actor,
            evaluation,
            report,
        })
    }

    fn deny(&self, action: Action, denial: Denial) -> ClientError {
        info!(
            evaluation_id = self.evaluation_id.0,
            action = ?action,
            "lifecycle: refused locally: {denial}"
        );
        self.notices.push(NoticeKind::Warning, denial.to_string());
        ClientError::Precondition(denial)
    }

    fn discarded(&self, action: Action) -> ClientError {
        debug!(
            evaluation_id = self.evaluation_id.0,
            action = ?action,
            "lifecycle: discarding response after detach"
        );
        ClientError::Detached
    }

    /// Passes `result` through unless the controller was detached meanwhile.
    fn current<T>(&self, epoch: u64, result: ApiResult<T>) -> ApiResult<T> {
        if self.lock().epoch != epoch {
            debug!(evaluation_id = self.evaluation_id.0, "lifecycle: discarding response after detach");
            return Err(ClientError::Detached);
        }
        result
    }

    /// Converts a network result for a running mutation. A conflict marks the
    /// snapshot stale and triggers an authoritative re-read.
    async fn settle<T>(&self, flight: &InFlight<'_>, result: ApiResult<T>) -> ApiResult<T> {
        let err = match self.current(flight.epoch, result) {
            Ok(value) => return Ok(value),
            Err(ClientError::Detached) => return Err(ClientError::Detached),
            Err(err) => err,
        };

        if err.is_conflict() {
            warn!(
                evaluation_id = self.evaluation_id.0,
                action = ?flight.action,
                "lifecycle: server rejected action, refreshing: {err}"
            );
            {
                let mut state = self.lock();
                if state.epoch == flight.epoch {
                    state.stale = true;
                }
            }
            self.notices.push(NoticeKind::Error, err.to_string());
            if let Err(refresh_err) = self.refresh().await {
                debug!(
                    evaluation_id = self.evaluation_id.0,
                    "lifecycle: refresh after conflict failed: {refresh_err}"
                );
            }
        } else {
            self.notify_failure(&err);
        }
        Err(err)
    }

    fn verify_evaluation(&self, evaluation: &Evaluation) -> Result<(), ClientError> {
        if evaluation.id != self.evaluation_id {
            return Err(ClientError::InvalidResponse(format!(
                "expected evaluation {}, got {}",
                self.evaluation_id, evaluation.id
            )));
        }
        if !evaluation.assignment_is_consistent() {
            return Err(ClientError::InvalidResponse(format!(
                "evaluation {} is {} but evaluator is {:?}",
                evaluation.id, evaluation.status, evaluation.evaluator_id
            )));
        }
        Ok(())
    }

    fn notify_failure(&self, err: &ClientError) {
        if !err.is_user_visible() {
            return;
        }
        if err.is_retryable() {
            warn!(evaluation_id = self.evaluation_id.0, "lifecycle: temporary failure: {err}");
        } else {
            warn!(evaluation_id = self.evaluation_id.0, "lifecycle: request failed: {err}");
        }
        self.notices.push(NoticeKind::Error, err.to_string());
    }
}

fn regresses(known: &Report, incoming: &Report) -> bool {
    known.id == incoming.id && !known.is_draft() && incoming.is_draft()
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
