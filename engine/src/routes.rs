use actix_web::http::StatusCode;
use actix_web::{get, post, web, HttpResponse};
use load_governor::{GovernorError, ResourceKind, SessionSpec, SimulatedPlant, Target};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::session_manager::SessionRegistry;

const SIMULATED_BASELINE: f64 = 10.0;
const SIMULATED_MEMORY: u64 = 16 * 1024 * 1024 * 1024;

#[derive(Deserialize)]
pub struct StartParams {
    kind: ResourceKind,
    target: f64,
    period_ms: Option<u64>,
    #[serde(default)]
    simulate: bool,
}

#[derive(Deserialize)]
pub struct TargetParams {
    target: f64,
}

#[post("/sessions")]
pub async fn start(params: web::Json<StartParams>, registry: web::Data<SessionRegistry>) -> HttpResponse {
    let params = params.into_inner();
    let target = match Target::new(params.target) {
        Ok(target) => target,
        Err(err) => return error_response(&err),
    };
    let period_ms = params.period_ms.unwrap_or(registry.config().period_ms);
    let spec = SessionSpec::new(params.kind, target, std::time::Duration::from_millis(period_ms));

    let started = if params.simulate {
        let plant = SimulatedPlant::new(SIMULATED_BASELINE, num_cpus::get(), SIMULATED_MEMORY);
        registry.start_with(spec, plant.session_parts(params.kind))
    } else {
        registry.start(spec)
    };
    match started {
        Ok(session) => {
            info!(session = session.id(), kind = %session.kind(), %target, simulate = params.simulate, "session started");
            HttpResponse::Created().json(json!({"status": "ok", "id": session.id(), "session": session.state()}))
        }
        Err(err) => error_response(&err),
    }
}

#[get("/sessions")]
pub async fn list(registry: web::Data<SessionRegistry>) -> HttpResponse {
    HttpResponse::Ok().json(registry.list())
}

#[get("/sessions/{id}")]
pub async fn status(path: web::Path<String>, registry: web::Data<SessionRegistry>) -> HttpResponse {
    match registry.get(&path.into_inner()) {
        Ok(session) => HttpResponse::Ok().json(session.state()),
        Err(err) => error_response(&err),
    }
}

#[post("/sessions/{id}/target")]
pub async fn set_target(
    path: web::Path<String>,
    params: web::Json<TargetParams>,
    registry: web::Data<SessionRegistry>,
) -> HttpResponse {
    let id = path.into_inner();
    let result = Target::new(params.target).and_then(|target| registry.set_target(&id, target));
    match result {
        Ok(snapshot) => {
            info!(session = %id, target = params.target, "target updated");
            HttpResponse::Ok().json(json!({"status": "ok", "session": snapshot}))
        }
        Err(err) => error_response(&err),
    }
}

#[post("/sessions/{id}/stop")]
pub async fn stop(path: web::Path<String>, registry: web::Data<SessionRegistry>) -> HttpResponse {
    let id = path.into_inner();
    match registry.stop(&id) {
        Ok(snapshot) => {
            info!(session = %id, "stop requested");
            HttpResponse::Ok().json(json!({"status": "ok", "session": snapshot}))
        }
        Err(err) => error_response(&err),
    }
}

#[post("/sessions/{id}/emergency-stop")]
pub async fn emergency_stop(path: web::Path<String>, registry: web::Data<SessionRegistry>) -> HttpResponse {
    let id = path.into_inner();
    match registry.emergency_stop(&id) {
        Ok(snapshot) => {
            warn!(session = %id, "emergency stop requested");
            HttpResponse::Ok().json(json!({"status": "ok", "session": snapshot}))
        }
        Err(err) => error_response(&err),
    }
}

#[get("/healthz")]
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "ok"}))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(healthz)
        .service(start)
        .service(list)
        .service(status)
        .service(set_target)
        .service(stop)
        .service(emergency_stop);
}

fn error_response(err: &GovernorError) -> HttpResponse {
    let code = match err {
        GovernorError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        GovernorError::SessionClosed(_) => StatusCode::CONFLICT,
        GovernorError::InvalidTarget(_) | GovernorError::UnknownKind(_) | GovernorError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    HttpResponse::build(code).json(json!({"status": "error", "reason": err.to_string()}))
}
