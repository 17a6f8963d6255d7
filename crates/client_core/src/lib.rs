//! Client core for the vehicle evaluation service: session handling, the
//! evaluation lifecycle controller and the REST client behind them.

pub mod api;
pub mod board;
pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod notices;
pub mod session;
pub mod validation;

pub use api::{AuthApi, EvaluationApi, PhotoUpload};
pub use board::EvaluationBoard;
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use controller::{EvaluationController, EvaluationView, ReportFileStatus};
pub use error::ClientError;
pub use http::HttpApiClient;
pub use lifecycle::{Action, Actor, Denial, ReportSlot};
pub use notices::{Notice, NoticeKind, NoticeQueue};
pub use session::{AuthSession, Session, SessionEndReason, SessionEvent, SessionPersistence};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
