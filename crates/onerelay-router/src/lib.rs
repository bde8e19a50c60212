//! HTTP surface: caller-facing relay routes and the `/api` admin routes.

mod admin;
mod proxy;

pub use admin::{AdminState, admin_router};
pub use proxy::{ProxyState, proxy_router};

use axum::Router;
use onerelay_core::Bootstrap;

pub fn app_router(boot: &Bootstrap) -> Router {
    Router::new()
        .merge(proxy_router(boot.engine.clone()))
        .merge(admin_router(AdminState::from(boot)))
}
