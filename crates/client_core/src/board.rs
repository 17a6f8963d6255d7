use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Datelike, Utc};
use shared::{
    domain::{City, Evaluation},
    protocol::{CreateEvaluationRequest, EvaluationListQuery},
};
use tracing::{info, warn};

use crate::{
    api::EvaluationApi,
    error::ClientError,
    notices::{NoticeKind, NoticeQueue},
    validation::{validate_list_query, validate_new_evaluation},
};

#[derive(Debug, Default)]
struct BoardState {
    query: EvaluationListQuery,
    evaluations: Vec<Evaluation>,
}

/// The "my evaluations" list: the last page fetched and the filter that
/// produced it.
pub struct EvaluationBoard {
    api: Arc<dyn EvaluationApi>,
    notices: Arc<NoticeQueue>,
    state: Mutex<BoardState>,
}

impl EvaluationBoard {
    pub fn new(api: Arc<dyn EvaluationApi>, notices: Arc<NoticeQueue>) -> Self {
        Self {
            api,
            notices,
            state: Mutex::new(BoardState::default()),
        }
    }

    pub fn evaluations(&self) -> Vec<Evaluation> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evaluations
            .clone()
    }

    pub fn query(&self) -> EvaluationListQuery {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .query
            .clone()
    }

    pub async fn load(&self, query: EvaluationListQuery) -> Result<Vec<Evaluation>, ClientError> {
        validate_list_query(&query)?;
        let evaluations = self.api.list_evaluations(&query).await.map_err(|err| {
            self.failed("failed to load evaluations", &err);
            err
        })?;

        info!(count = evaluations.len(), status = ?query.status, "board: evaluations loaded");
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.query = query;
        state.evaluations = evaluations.clone();
        Ok(evaluations)
    }

    /// Reloads with the filter of the previous load.
    pub async fn reload(&self) -> Result<Vec<Evaluation>, ClientError> {
        self.load(self.query()).await
    }

    pub async fn create(&self, request: CreateEvaluationRequest) -> Result<Evaluation, ClientError> {
        validate_new_evaluation(&request, Utc::now().year())?;
        let created = self.api.create_evaluation(&request).await.map_err(|err| {
            self.failed("failed to create evaluation", &err);
            err
        })?;

        info!(evaluation_id = created.id.0, "board: evaluation created");
        self.notices
            .push(NoticeKind::Success, "Evaluation created");
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let matches_filter = state
            .query
            .status
            .map_or(true, |status| status == created.status);
        if matches_filter {
            state.evaluations.insert(0, created.clone());
        }
        Ok(created)
    }

    pub async fn cities(&self) -> Result<Vec<City>, ClientError> {
        self.api.list_cities().await.map_err(|err| {
            self.failed("failed to load cities", &err);
            err
        })
    }

    fn failed(&self, what: &str, err: &ClientError) {
        if err.is_user_visible() {
            warn!("board: {what}: {err}");
            self.notices.push(NoticeKind::Error, err.to_string());
        }
    }
}

#[cfg(test)]
#[path = "tests/board_tests.rs"]
mod tests;
