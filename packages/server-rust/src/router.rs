//! Router seam. Routing itself is provided by an external crate that
//! implements [`KoattyRouter`] and is installed with
//! [`Koatty::set_router`](crate::Koatty::set_router).

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;
use koatty_core::ComponentClass;

use crate::application::Koatty;
use crate::middleware::Middleware;

/// Options a router is constructed with.
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub prefix: String,
    /// Methods the router answers; empty means all.
    pub methods: Vec<Method>,
    pub router_path: Option<String>,
    /// Case-sensitive matching.
    pub sensitive: bool,
    /// Trailing slash is significant.
    pub strict: bool,
    /// Proto file for grpc routers.
    pub proto_file: Option<String>,
}

/// A protocol router.
#[async_trait]
pub trait KoattyRouter: Send + Sync + 'static {
    fn options(&self) -> &RouterOptions;

    /// Binds `handler` to `path`, optionally for one method only.
    fn set_router(&self, path: &str, handler: Arc<dyn Middleware>, method: Option<Method>);

    /// Every registered route, formatted by the router.
    fn list_router(&self) -> Vec<String>;

    /// Registers the routes of every controller in `controllers`.
    async fn load_router(
        &self,
        app: &Arc<Koatty>,
        controllers: Vec<(String, ComponentClass)>,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use parking_lot::RwLock;

    use super::*;
    use crate::application::InitOptions;
    use crate::context::{BaseContext, Inbound};
    use crate::middleware::{middleware_fn, Next};

    #[derive(Default)]
    struct TableRouter {
        options: RouterOptions,
        routes: RwLock<BTreeMap<String, Arc<dyn Middleware>>>,
    }

    #[async_trait]
    impl KoattyRouter for TableRouter {
        fn options(&self) -> &RouterOptions {
            &self.options
        }

        fn set_router(&self, path: &str, handler: Arc<dyn Middleware>, method: Option<Method>) {
            let method = method.map_or_else(|| "ALL".to_string(), |m| m.to_string());
            self.routes.write().insert(format!("{method} {path}"), handler);
        }

        fn list_router(&self) -> Vec<String> {
            self.routes.read().keys().cloned().collect()
        }

        async fn load_router(
            &self,
            _app: &Arc<Koatty>,
            controllers: Vec<(String, ComponentClass)>,
        ) -> anyhow::Result<()> {
            for (identifier, _class) in controllers {
                let path = format!("/{}", identifier.to_lowercase());
                let body = identifier.clone();
                self.set_router(
                    &path,
                    Arc::new(middleware_fn(move |ctx, _next| {
                        let body = body.clone();
                        Box::pin(async move {
                            ctx.set_body(body);
                            Ok(())
                        })
                    })),
                    Some(Method::GET),
                );
            }
            Ok(())
        }
    }

    struct UserController;

    #[tokio::test]
    async fn installed_router_loads_and_dispatches() {
        let app = Koatty::new(InitOptions::default());
        let router = Arc::new(TableRouter::default());
        app.set_router(router.clone());

        let installed = app.router().unwrap();
        installed
            .load_router(
                &app,
                vec![(
                    "UserController".to_string(),
                    ComponentClass::of::<UserController>(),
                )],
            )
            .await
            .unwrap();
        assert_eq!(installed.list_router(), vec!["GET /usercontroller"]);
        assert!(installed.options().prefix.is_empty());

        let handler = router.routes.read().values().next().cloned().unwrap();
        let mut ctx = app
            .create_context(BaseContext::default(), "http", Inbound::Http)
            .unwrap();
        handler.handle(&mut ctx, Next::new(&[])).await.unwrap();
        assert_eq!(ctx.body().to_json(), "UserController");
    }
}
