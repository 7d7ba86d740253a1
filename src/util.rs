use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Variables naming an explicit env file, checked in order.
const ENV_FILE_VARS: [&str; 3] = ["ENV_FILE", "ENVFILE", "DOTENV_PATH"];

/// Load the first env file found. Existing variables are never overwritten.
/// Returns a label for the file that was loaded.
fn load_env_file() -> Option<String> {
    let explicit = ENV_FILE_VARS.iter().find_map(|var| {
        let path = std::env::var(var).ok()?;
        let path = path.trim();
        (!path.is_empty() && Path::new(path).is_file() && dotenvy::from_filename(path).is_ok())
            .then(|| format!("{path} (via {var})"))
    });
    explicit
        .or_else(|| {
            (Path::new(".envfile").is_file() && dotenvy::from_filename(".envfile").is_ok())
                .then(|| ".envfile".to_string())
        })
        .or_else(|| dotenvy::dotenv().ok().map(|p| p.display().to_string()))
}

/// Load the env file, then install the fmt subscriber with a filter from
/// `RUST_LOG` (default `info`). Safe to call more than once.
pub fn init_tracing() {
    let env_file = load_env_file();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if fmt().with_env_filter(filter).try_init().is_err() {
        debug!("tracing subscriber already installed");
    }
    match env_file {
        Some(file) => tracing::info!(env_file = %file, "environment file loaded"),
        None => tracing::info!("no environment file found"),
    }
}

/// JSON error body `{"error":{"message":…,"type":…}}`.
pub fn error_response(status: StatusCode, kind: &str, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg, "type": kind } });
    HttpResponse::build(status).json(body)
}

/// CORS policy from a configured origin list. An empty list or `*` allows any
/// origin. `CORS_ALLOW_CREDENTIALS` and `CORS_MAX_AGE` tune the rest.
pub fn cors_from_origins(origins: &[String]) -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default()
        .allow_any_method()
        .allow_any_header()
        .expose_headers(vec!["x-request-id"]);

    let explicit: Vec<&str> = origins
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .collect();
    if explicit.is_empty() || explicit.contains(&"*") {
        cors = cors.allow_any_origin();
    } else {
        for origin in explicit {
            cors = cors.allowed_origin(origin);
        }
    }

    if env_truthy("CORS_ALLOW_CREDENTIALS", false) {
        cors = cors.supports_credentials();
    }
    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }
    cors
}

pub fn env_truthy(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        }
        Err(_) => default,
    }
}

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Flag slow persistence calls.
pub fn log_store_latency(store: &str, operation: &str, elapsed: Duration) {
    if elapsed >= Duration::from_millis(250) {
        warn!(
            duration_ms = elapsed.as_millis() as u64,
            "{} store {} latency", store, operation
        );
    } else if elapsed >= Duration::from_millis(50) {
        debug!(
            duration_ms = elapsed.as_millis() as u64,
            "{} store {} latency", store, operation
        );
    }
}
