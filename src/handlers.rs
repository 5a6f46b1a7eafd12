use crate::error::StatusReadError;
use crate::publisher::{read_snapshot, read_status};
use crate::types::{Outcome, Snapshot};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::fmt::Write;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{error, warn};

pub async fn handle_connection(stream: TcpStream, status_path: Arc<PathBuf>) {
    let service = service_fn(move |req| {
        let status_path = status_path.clone();
        async move { Ok::<_, Infallible>(route_request(&req, status_path).await) }
    });

    if let Err(e) = Http::new().http1_only(true).serve_connection(stream, service).await {
        error!("Connection error: {}", e);
    }
}

pub async fn route_request(req: &Request<Body>, status_path: Arc<PathBuf>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            let version = env!("CARGO_PKG_VERSION");
            let build = option_env!("GIT_COMMIT_HASH").unwrap_or("unknown");
            json_response(StatusCode::OK, json!({ "version": version, "build": build }).to_string())
        }
        (&Method::GET, "/api/status") => api_status(off_worker(status_path, read_status).await),
        (&Method::GET, "/") => html_response(render_index(off_worker(status_path, read_snapshot).await)),
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" }).to_string()),
    }
}

/// Run a blocking status-file read on the blocking pool.
async fn off_worker<T, F>(status_path: Arc<PathBuf>, read: F) -> Result<T, StatusReadError>
where
    T: Send + 'static,
    F: FnOnce(&Path) -> Result<T, StatusReadError> + Send + 'static,
{
    let path = status_path.clone();
    tokio::task::spawn_blocking(move || read(path.as_path()))
        .await
        .unwrap_or_else(|e| {
            Err(StatusReadError::Io {
                path: status_path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::Other, e.to_string()),
            })
        })
}

/// The status record verbatim; 404 before the first publish, 500 if unreadable.
fn api_status(record: Result<Value, StatusReadError>) -> Response<Body> {
    match record {
        Ok(record) => json_response(StatusCode::OK, record.to_string()),
        Err(e @ StatusReadError::Missing { .. }) => {
            json_response(StatusCode::NOT_FOUND, json!({ "error": e.to_string() }).to_string())
        }
        Err(e) => {
            warn!("Failed to read status record: {}", e);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.to_string() }).to_string(),
            )
        }
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    with_content_type(status, body, "application/json")
}

fn html_response(body: String) -> Response<Body> {
    with_content_type(StatusCode::OK, body, "text/html; charset=utf-8")
}

fn with_content_type(status: StatusCode, body: String, content_type: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Proxy Selector</title>
<style>
body { font-family: Arial, sans-serif; margin: 40px; }
table { border-collapse: collapse; width: 100%; }
th, td { border: 1px solid #ddd; padding: 8px; text-align: left; }
th { background-color: #f2f2f2; }
.best { background-color: #c8e6c9; font-weight: bold; }
.error { color: #721c24; }
</style>
</head>
<body>
<h1>Proxy Selector</h1>
"#;

const PAGE_TAIL: &str = r#"<p><a href="/api/status">API endpoint: /api/status</a></p>
</body>
</html>
"#;

fn render_index(snapshot: Result<Snapshot, StatusReadError>) -> String {
    let mut page = String::from(PAGE_HEAD);

    let snapshot = match snapshot {
        Ok(snapshot) => snapshot,
        Err(e @ StatusReadError::Missing { .. }) => {
            let _ = writeln!(
                page,
                "<p class=\"error\">{}. Is the selector running?</p>",
                escape_html(&e.to_string())
            );
            page.push_str(PAGE_TAIL);
            return page;
        }
        Err(e) => {
            let _ = writeln!(page, "<p class=\"error\">{}</p>", escape_html(&e.to_string()));
            page.push_str(PAGE_TAIL);
            return page;
        }
    };

    let last_update = snapshot.last_update.format("%Y-%m-%d %H:%M:%S");
    match &snapshot.best {
        Some(best) => {
            let _ = writeln!(
                page,
                "<p><strong>Best proxy:</strong> <code>{}</code> ({} ms)</p>",
                escape_html(best.candidate.as_str()),
                best.delay_ms.unwrap_or_default()
            );
        }
        None => page.push_str("<p class=\"error\"><strong>No usable proxy.</strong></p>\n"),
    }
    let _ = writeln!(page, "<p><strong>Last update:</strong> {}</p>", last_update);

    page.push_str("<table>\n<tr><th>Proxy</th><th>Status</th><th>Delay (ms)</th><th>Error</th></tr>\n");
    if snapshot.results.is_empty() {
        page.push_str("<tr><td colspan=\"4\">No candidates configured.</td></tr>\n");
    }
    for result in &snapshot.results {
        let is_best = snapshot.best.as_ref().map(|b| &b.candidate) == Some(&result.candidate);
        let status = match result.outcome {
            Outcome::Success => "success",
            Outcome::Failure => "failed",
        };
        let delay = result
            .delay_ms
            .map(|d| d.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let _ = writeln!(
            page,
            "<tr{}><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            if is_best { " class=\"best\"" } else { "" },
            escape_html(result.candidate.as_str()),
            status,
            delay,
            escape_html(result.error.as_deref().unwrap_or(""))
        );
    }
    page.push_str("</table>\n");
    page.push_str(PAGE_TAIL);
    page
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
