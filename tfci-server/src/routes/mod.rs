//! Feature modules contributing routes to the server.
//!
//! Each module exposes `register`, which queues its bindings in the route
//! registry. [`MODULES`] is the complete list; nothing registers implicitly.

pub mod events;
pub mod runs;
pub mod site;

use tfci::config::ServerConfig;
use tfci::registry::{Registry, RegistryError};
use tracing::debug;

use crate::server::RouteTable;

type RegisterFn = fn(&Registry<RouteTable>, &ServerConfig) -> Result<(), RegistryError>;

/// Every route module, in registration order.
pub const MODULES: &[(&str, RegisterFn)] = &[
    ("runs", runs::register),
    ("events", events::register),
    ("site", site::register),
];

/// Queue the routes of every module in [`MODULES`].
pub fn register_all(
    registry: &Registry<RouteTable>,
    config: &ServerConfig,
) -> Result<(), RegistryError> {
    for (name, register) in MODULES {
        register(registry, config)?;
        debug!(module = name, "module registered");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, Response};
    use tfci::io::provisioner::Provisioner;
    use tfci::registry::Registry;
    use tfci::scheduler::Scheduler;
    use tfci::test_support::{ScriptedProvisioner, TestCheckout};
    use tower::ServiceExt;

    use super::register_all;
    use crate::server::{RouteTable, build_router};
    use crate::state::AppState;

    /// A fully registered app over a temporary checkout.
    pub struct TestApp {
        pub checkout: TestCheckout,
        pub provisioner: Arc<ScriptedProvisioner>,
        pub state: AppState,
        pub router: Router,
    }

    impl TestApp {
        pub fn new(provisioner: ScriptedProvisioner) -> Self {
            Self::with_checkout(TestCheckout::new(), provisioner)
        }

        pub fn with_checkout(checkout: TestCheckout, provisioner: ScriptedProvisioner) -> Self {
            let provisioner = Arc::new(provisioner);
            let scheduler = Scheduler::start(
                &checkout.config,
                checkout.open_store(),
                provisioner.clone() as Arc<dyn Provisioner>,
            )
            .expect("start scheduler");
            let state = AppState::new(Arc::new(checkout.config.clone()), scheduler);
            let registry = Registry::<RouteTable>::new();
            register_all(&registry, &checkout.config).expect("register");
            let router = build_router(&registry, state.clone()).expect("router");
            Self {
                checkout,
                provisioner,
                state,
                router,
            }
        }

        pub fn scheduler(&self) -> &Scheduler {
            &self.state.scheduler
        }

        pub async fn send(&self, request: Request<Body>) -> Response<Body> {
            self.router
                .clone()
                .oneshot(request)
                .await
                .expect("infallible")
        }

        pub async fn get(&self, uri: &str) -> Response<Body> {
            self.send(Request::get(uri).body(Body::empty()).expect("request"))
                .await
        }

        pub async fn post(&self, uri: &str, body: &str) -> Response<Body> {
            self.send(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
        }
    }

    pub async fn body_text(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf-8 body")
    }

    pub async fn body_json(response: Response<Body>) -> serde_json::Value {
        serde_json::from_str(&body_text(response).await).expect("json body")
    }
}
