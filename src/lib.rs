pub mod config;
pub mod csp;
pub mod etag;
pub mod playground;
pub mod redirect;
pub mod routes;
pub mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{middleware, Router};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use config::{Config, ConfigError, Mode};
use csp::{CspError, CspOptions, CspState, InlineScriptHashes, ManifestError};
use redirect::{RedirectError, RedirectTable};

/// Anything that stops the server before it binds its port.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("static root {} is not a directory", .0.display())]
    StaticRoot(PathBuf),
    #[error("CSP hash manifest {}: {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },
    #[error(transparent)]
    Csp(#[from] CspError),
    #[error(transparent)]
    Redirect(#[from] RedirectError),
}

/// The layer that differs between the two modes.
#[derive(Clone)]
pub enum ModeLayer {
    Main(Arc<CspState>),
    Playground,
}

#[derive(Clone)]
pub struct AppState {
    pub static_root: PathBuf,
    pub redirects: Arc<RedirectTable>,
    pub mode: ModeLayer,
}

impl AppState {
    /// Loads and validates everything the server needs. In main mode the
    /// hash manifest must load and be non-empty, otherwise no state is built.
    pub fn prepare(config: &Config) -> Result<Self, StartupError> {
        if !config.static_root.is_dir() {
            return Err(StartupError::StaticRoot(config.static_root.clone()));
        }

        let redirects = match &config.redirects_file {
            Some(path) => RedirectTable::load(path)?,
            None => RedirectTable::default(),
        };
        tracing::info!(rules = redirects.rules().len(), "redirect table loaded");

        let mode = match config.mode {
            Mode::Main => {
                let hashes = InlineScriptHashes::load(&config.csp_hashes_file).map_err(|source| {
                    StartupError::Manifest {
                        path: config.csp_hashes_file.clone(),
                        source,
                    }
                })?;
                let options = CspOptions {
                    report_violations: config.report_csp_violations,
                    playground_origin: config.playground_origin.clone(),
                };
                let policy = csp::build_policy_header(&hashes, &options)?;
                tracing::info!(
                    hashes = hashes.len(),
                    report_violations = options.report_violations,
                    "content security policy built"
                );
                ModeLayer::Main(Arc::new(CspState::new(policy, options.report_violations)))
            }
            Mode::Playground => ModeLayer::Playground,
        };

        Ok(Self {
            static_root: config.static_root.clone(),
            redirects: Arc::new(redirects),
            mode,
        })
    }
}

/// Request pipeline, outermost first: redirects, mode layer (CSP or
/// playground headers), ETag revalidation, font caching, static files.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .fallback_service(routes::asset_service(&state.static_root))
        .layer(middleware::from_fn(routes::font_cache_middleware))
        .layer(middleware::from_fn(etag::etag_middleware));

    let router = match state.mode {
        ModeLayer::Main(csp_state) => {
            router.layer(middleware::from_fn_with_state(csp_state, csp::csp_middleware))
        }
        ModeLayer::Playground => router.layer(middleware::from_fn(playground::playground_middleware)),
    };

    router
        .layer(middleware::from_fn_with_state(
            state.redirects,
            redirect::redirect_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}
