//! Static asset serving for the prebuilt storefront SPA
//!
//! The site root is chosen once at startup from an ordered list of candidate
//! build directories. Requests for files that exist under the root are served
//! directly; everything else gets the root `index.html` so client-side routing
//! can take over.

use crate::error::{json_error_response, BoxError, GatewayBody, GatewayErrorCode};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CACHE_CONTROL};
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::set_header::SetResponseHeader;
use tracing::{debug, error, warn};

/// File that marks a usable build directory and doubles as the SPA shell
pub const INDEX_FILE: &str = "index.html";

/// `index.html` served with `no-cache` so clients pick up new builds
type ShellService = SetResponseHeader<ServeFile, HeaderValue>;

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("no build directory found, looked for: {}", join_paths(.candidates))]
    NoBuildDirectory { candidates: Vec<PathBuf> },
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where a request path ends up
#[derive(Debug, PartialEq, Eq)]
enum Lookup {
    /// An existing file or directory inside the root
    File,
    /// Anything else, answered with the SPA shell
    Shell,
}

/// The resolved build directory
#[derive(Clone)]
pub struct SiteRoot {
    /// Canonical path, so containment checks compare like with like
    root: PathBuf,
    files: ServeDir<ShellService>,
    shell: ShellService,
}

impl fmt::Debug for SiteRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteRoot").field("root", &self.root).finish()
    }
}

impl SiteRoot {
    /// Pick the first candidate that is a directory containing `index.html`
    pub fn resolve(candidates: &[PathBuf]) -> Result<Self, SiteError> {
        for dir in candidates {
            if !dir.is_dir() || !dir.join(INDEX_FILE).is_file() {
                debug!(dir = %dir.display(), "Not a usable build directory");
                continue;
            }
            match dir.canonicalize() {
                Ok(root) => return Ok(Self::new(root)),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to canonicalize build directory");
                }
            }
        }

        Err(SiteError::NoBuildDirectory {
            candidates: candidates.to_vec(),
        })
    }

    fn new(root: PathBuf) -> Self {
        let shell = SetResponseHeader::overriding(
            ServeFile::new_with_mime(root.join(INDEX_FILE), &mime::TEXT_HTML_UTF_8),
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        );
        let files = ServeDir::new(&root)
            .append_index_html_on_directories(true)
            .fallback(shell.clone());

        Self { root, files, shell }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Serve a non-API request
    pub async fn serve<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Send + 'static,
    {
        let path = req.uri().path().to_string();
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return json_error_response(
                GatewayErrorCode::NotFound,
                format!("Cannot {} {}", req.method(), path),
            );
        }

        let response = match self.lookup(&path).await {
            Lookup::File => {
                debug!(path, "Serving static file");
                into_gateway_response(self.files.clone().oneshot(req).await)
            }
            Lookup::Shell => into_gateway_response(self.shell.clone().oneshot(req).await),
        };

        // The shell vanished from under us, or the filesystem failed
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status.is_server_error() {
            error!(
                path,
                status = status.as_u16(),
                root = %self.root.display(),
                "Failed to serve site, is the build directory still in place?"
            );
            return json_error_response(GatewayErrorCode::InternalError, "Site index unavailable");
        }

        response
    }

    /// Decide whether `path` may be handed to the file service.
    ///
    /// Only paths that canonicalise to something inside the root qualify; the
    /// root itself and its `index.html` always go through the shell.
    async fn lookup(&self, path: &str) -> Lookup {
        let Some(relative) = sanitize_path(path) else {
            return Lookup::Shell;
        };
        let Ok(candidate) = tokio::fs::canonicalize(self.root.join(relative)).await else {
            return Lookup::Shell;
        };

        // Symlinks may point outside the root
        if !candidate.starts_with(&self.root) {
            return Lookup::Shell;
        }
        if candidate == self.root || candidate == self.root.join(INDEX_FILE) {
            return Lookup::Shell;
        }

        let is_dir = tokio::fs::metadata(&candidate).await.map(|m| m.is_dir()).unwrap_or(false);
        if is_dir {
            match tokio::fs::canonicalize(candidate.join(INDEX_FILE)).await {
                Ok(index) if !index.starts_with(&self.root) => return Lookup::Shell,
                _ => {}
            }
        }

        Lookup::File
    }
}

fn into_gateway_response<B>(result: Result<Response<B>, Infallible>) -> Response<GatewayBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    match result {
        Ok(response) => response.map(|body| body.map_err(Into::<BoxError>::into).boxed_unsync()),
        Err(never) => match never {},
    }
}

/// Decode a URL path into a relative filesystem path.
///
/// Returns `None` for anything that could climb out of the root: `..`
/// segments, backslashes, NUL bytes, or invalid percent-encoding.
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(path).ok()?;
    if decoded.contains('\0') {
        return None;
    }

    let mut relative = PathBuf::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\\') => return None,
            s => relative.push(s),
        }
    }
    Some(relative)
}
