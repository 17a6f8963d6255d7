use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, Action, EvaluationBoard, EvaluationController, HttpApiClient, NoticeKind,
    NoticeQueue, PhotoUpload, ReportFileStatus, ReportSlot, Session,
};
use serde::Serialize;
use shared::{
    domain::{CityId, EvaluationId, EvaluationStatus, Role},
    protocol::{
        CreateEvaluationRequest, EvaluationListQuery, LoginRequest, SignupRequest,
        UpdateProfileRequest,
    },
};
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Command line client for the vehicle evaluation service")]
struct Cli {
    /// Overrides `api_base_url` from client.toml and the environment.
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, default_value = "user")]
        role: Role,
    },
    Logout,
    Whoami,
    Profile {
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        phone: Option<String>,
    },
    List {
        #[arg(long)]
        status: Option<EvaluationStatus>,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },
    Create {
        #[arg(long)]
        city_id: i64,
        #[arg(long)]
        make: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        plate: String,
        #[arg(long)]
        year: i32,
        #[arg(long)]
        notes: String,
    },
    Cities,
    Show {
        id: i64,
    },
    Accept {
        id: i64,
    },
    Start {
        id: i64,
    },
    Complete {
        id: i64,
    },
    Cancel {
        id: i64,
    },
    ReportCreate {
        id: i64,
        #[arg(long)]
        summary: String,
    },
    ReportUpdate {
        id: i64,
        #[arg(long)]
        summary: String,
    },
    ReportFinalize {
        id: i64,
    },
    ReportView {
        id: i64,
    },
    Photos {
        id: i64,
    },
    AddPhoto {
        id: i64,
        path: PathBuf,
        /// Guessed from the file extension when omitted.
        #[arg(long)]
        content_type: Option<String>,
    },
}

struct App {
    client: Arc<HttpApiClient>,
    session: Arc<Session>,
    notices: Arc<NoticeQueue>,
}

impl App {
    async fn controller(&self, id: i64) -> Result<Arc<EvaluationController>> {
        let controller = EvaluationController::new(
            self.client.clone(),
            self.session.clone(),
            self.notices.clone(),
            EvaluationId(id),
        );
        controller.refresh().await?;
        Ok(controller)
    }

    fn board(&self) -> EvaluationBoard {
        EvaluationBoard::new(self.client.clone(), self.notices.clone())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_allowed(actions: &[Action]) {
    let names: Vec<String> = actions.iter().map(|action| format!("{action:?}")).collect();
    println!("allowed: {}", names.join(", "));
}

fn guess_content_type(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("heic") => "image/heic",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn notice_label(kind: NoticeKind) -> &'static str {
    match kind {
        NoticeKind::Success => "ok",
        NoticeKind::Error => "error",
        NoticeKind::Warning => "warning",
        NoticeKind::Info => "info",
    }
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let user = app
                .session
                .login(app.client.as_ref(), &LoginRequest { email, password })
                .await?;
            println!("signed in as {} ({})", user.email, user.role);
        }
        Command::Signup {
            email,
            full_name,
            password,
            phone,
            role,
        } => {
            let request = SignupRequest {
                email,
                full_name,
                password,
                phone,
                role,
                document_id: None,
                bio: None,
            };
            let user = app.session.signup(app.client.as_ref(), &request).await?;
            println!("account created for {} ({})", user.email, user.role);
        }
        Command::Logout => {
            app.session.logout().await;
            println!("signed out");
        }
        Command::Whoami => {
            let user = app.session.load_me(app.client.as_ref()).await?;
            print_json(&user)?;
        }
        Command::Profile { full_name, phone } => {
            let user = app
                .session
                .update_profile(app.client.as_ref(), &UpdateProfileRequest { full_name, phone })
                .await?;
            print_json(&user)?;
        }
        Command::List {
            status,
            page,
            limit,
        } => {
            let evaluations = app
                .board()
                .load(EvaluationListQuery {
                    status,
                    page,
                    limit,
                })
                .await?;
            for evaluation in evaluations {
                println!(
                    "#{} {} {} {} ({}) evaluator={}",
                    evaluation.id,
                    evaluation.status,
                    evaluation.vehicle_make,
                    evaluation.vehicle_model,
                    evaluation.vehicle_plate,
                    evaluation
                        .evaluator_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string())
                );
            }
        }
        Command::Create {
            city_id,
            make,
            model,
            plate,
            year,
            notes,
        } => {
            let created = app
                .board()
                .create(CreateEvaluationRequest {
                    city_id: CityId(city_id),
                    vehicle_make: make,
                    vehicle_model: model,
                    vehicle_plate: plate,
                    vehicle_year: year,
                    notes,
                })
                .await?;
            print_json(&created)?;
        }
        Command::Cities => {
            for city in app.board().cities().await? {
                println!("{} {} {}", city.id, city.name, city.state);
            }
        }
        Command::Show { id } => {
            let controller = app.controller(id).await?;
            let view = controller
                .snapshot()
                .context("evaluation was not loaded")?;
            print_json(&view.evaluation)?;
            match &view.report {
                ReportSlot::Present(report) => println!("report: #{} {}", report.id, report.status),
                ReportSlot::Absent => println!("report: none"),
                ReportSlot::Unknown => println!("report: not looked up"),
            }
            println!("photos: {}", view.photos.len());
            print_allowed(&view.allowed_actions);
        }
        Command::Accept { id } => {
            let evaluation = app.controller(id).await?.accept().await?;
            println!("evaluation #{} is {}", evaluation.id, evaluation.status);
        }
        Command::Start { id } => {
            let evaluation = app.controller(id).await?.start().await?;
            println!("evaluation #{} is {}", evaluation.id, evaluation.status);
        }
        Command::Complete { id } => {
            let evaluation = app.controller(id).await?.complete().await?;
            println!("evaluation #{} is {}", evaluation.id, evaluation.status);
        }
        Command::Cancel { id } => {
            let evaluation = app.controller(id).await?.cancel().await?;
            println!("evaluation #{} is {}", evaluation.id, evaluation.status);
        }
        Command::ReportCreate { id, summary } => {
            let report = app.controller(id).await?.create_report(&summary).await?;
            print_json(&report)?;
        }
        Command::ReportUpdate { id, summary } => {
            let report = app.controller(id).await?.update_report(&summary).await?;
            print_json(&report)?;
        }
        Command::ReportFinalize { id } => {
            let report = app.controller(id).await?.finalize_report().await?;
            print_json(&report)?;
        }
        Command::ReportView { id } => match app.controller(id).await?.view_report().await? {
            ReportFileStatus::Available { url } => println!("{url}"),
            ReportFileStatus::NotYetAvailable => println!("report file not available yet"),
        },
        Command::Photos { id } => {
            for photo in app.controller(id).await?.refresh_photos().await? {
                println!("#{} {}", photo.id, photo.url);
            }
        }
        Command::AddPhoto {
            id,
            path,
            content_type,
        } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read photo '{}'", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("photo")
                .to_string();
            let content_type =
                content_type.unwrap_or_else(|| guess_content_type(&path).to_string());
            let photos = app
                .controller(id)
                .await?
                .add_photo(PhotoUpload {
                    filename,
                    content_type,
                    bytes,
                })
                .await?;
            for photo in photos {
                println!("#{} {}", photo.id, photo.url);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(api_base_url) = cli.api_base_url {
        settings.api_base_url = api_base_url;
    }
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }

    let storage = Storage::new(&settings.database_url).await?;
    let session = Session::new(Arc::new(storage));
    if let Some(user) = session.restore().await? {
        info!(user_id = user.id.0, "evalctl: resumed session");
    }

    let app = App {
        client: Arc::new(HttpApiClient::new(&settings, session.clone())?),
        session,
        notices: Arc::new(NoticeQueue::new()),
    };
    let outcome = run(&app, cli.command).await;
    for notice in app.notices.active() {
        eprintln!("[{}] {}", notice_label(notice.kind), notice.message);
    }
    outcome
}
