//! Context construction per protocol.

use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use koatty_core::{KoattyError, KoattyProtocol, MetadataValue};
use tracing::debug;

use super::graphql::GraphQLInfo;
use super::grpc::{handler_path, RpcCallback, RpcHandle, ServerCall};
use super::{BaseContext, KoattyContext};
use crate::application::Koatty;
use crate::server::ConnectionHandle;

/// Protocol-specific inputs that arrive alongside the base request.
pub enum Inbound {
    /// Plain HTTP/HTTPS and GraphQL requests carry nothing extra.
    Http,
    /// One websocket message and the connection it arrived on.
    WebSocket {
        socket: Option<Arc<ConnectionHandle>>,
        message: Bytes,
    },
    /// A gRPC call and its completion callback.
    Grpc {
        call: Option<Arc<dyn ServerCall>>,
        callback: Option<RpcCallback>,
    },
}

/// Builds a [`KoattyContext`] for `protocol`.
///
/// # Errors
///
/// Returns [`KoattyError::ContextCreation`] if `protocol` is not one of
/// `http`, `https`, `ws`, `wss`, `grpc`, `graphql`.
pub fn create_koatty_context(
    app: &Arc<Koatty>,
    base: BaseContext,
    protocol: &str,
    inbound: Inbound,
) -> Result<KoattyContext, KoattyError> {
    let protocol = protocol
        .parse::<KoattyProtocol>()
        .map_err(KoattyError::ContextCreation)?;
    Ok(build_context(app, base, protocol, inbound))
}

pub(crate) fn build_context(
    app: &Arc<Koatty>,
    base: BaseContext,
    protocol: KoattyProtocol,
    inbound: Inbound,
) -> KoattyContext {
    let recycled = app.context_pool().and_then(|pool| pool.acquire(protocol));
    let mut ctx = KoattyContext::new(Arc::clone(app), protocol, base, recycled);

    match protocol {
        KoattyProtocol::Http | KoattyProtocol::Https => {}
        KoattyProtocol::Ws | KoattyProtocol::Wss => init_websocket(&mut ctx, inbound),
        KoattyProtocol::Grpc => init_grpc(&mut ctx, inbound),
        KoattyProtocol::Graphql => init_graphql(&mut ctx),
    }
    ctx
}

fn init_websocket(ctx: &mut KoattyContext, inbound: Inbound) {
    let (socket, message) = match inbound {
        Inbound::WebSocket { socket, message } => (socket, message),
        _ => (None, ctx.request.body.clone()),
    };
    ctx.set_status(StatusCode::OK);
    ctx.websocket = socket;
    ctx.metadata.set(
        "_body",
        MetadataValue::Text(String::from_utf8_lossy(&message).into_owned()),
    );
}

fn init_grpc(ctx: &mut KoattyContext, inbound: Inbound) {
    ctx.set_status(StatusCode::OK);

    let Inbound::Grpc {
        call: Some(call),
        callback,
    } = inbound
    else {
        debug!(request_id = %ctx.request_id, "grpc context created without a call handle");
        return;
    };

    ctx.metadata.merge(&call.metadata());
    ctx.metadata.set("originalPath", handler_path(call.as_ref()));
    let request = call
        .request()
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    ctx.metadata.set("_body", MetadataValue::from_json(request));
    ctx.rpc = Some(RpcHandle { call, callback });
}

fn init_graphql(ctx: &mut KoattyContext) {
    let info = GraphQLInfo::from_request(&ctx.request);
    let original_path = match ctx.request.path() {
        "/" | "" => "/graphql".to_string(),
        path => path.to_string(),
    };

    ctx.metadata.set("originalPath", original_path);
    ctx.metadata.set(
        "_body",
        MetadataValue::Text(String::from_utf8_lossy(&ctx.request.body).into_owned()),
    );
    ctx.metadata.set("graphqlQuery", info.query.clone());
    ctx.metadata.set(
        "graphqlVariables",
        MetadataValue::Json(serde_json::Value::Object(info.variables.clone())),
    );
    ctx.metadata.set(
        "graphqlOperationName",
        info.operation_name.clone().unwrap_or_default(),
    );
    ctx.graphql = Some(info);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::http::{Method, Uri};
    use koatty_core::Metadata;
    use serde_json::json;

    use super::*;
    use crate::application::InitOptions;
    use crate::context::grpc::{RpcHandler, RpcReply};

    struct FakeCall {
        incoming: Metadata,
        handler: Option<RpcHandler>,
        inner: Option<Box<FakeCall>>,
        payload: Option<serde_json::Value>,
        sent: Mutex<Vec<Metadata>>,
    }

    impl FakeCall {
        fn new() -> Self {
            let mut incoming = Metadata::new();
            incoming.set("authorization", "token");
            Self {
                incoming,
                handler: Some(RpcHandler::new("/pkg.Svc/Method")),
                inner: None,
                payload: Some(json!({ "name": "koatty" })),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl ServerCall for FakeCall {
        fn metadata(&self) -> Metadata {
            self.incoming.clone()
        }

        fn handler(&self) -> Option<&RpcHandler> {
            self.handler.as_ref()
        }

        fn inner_call(&self) -> Option<&dyn ServerCall> {
            self.inner.as_deref().map(|c| c as &dyn ServerCall)
        }

        fn request(&self) -> Option<serde_json::Value> {
            self.payload.clone()
        }

        fn send_metadata(&self, metadata: Metadata) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(metadata);
            Ok(())
        }
    }

    fn app() -> Arc<Koatty> {
        Koatty::new(InitOptions::default())
    }

    #[test]
    fn http_context_defaults() {
        let ctx =
            create_koatty_context(&app(), BaseContext::default(), "http", Inbound::Http).unwrap();
        assert_eq!(ctx.protocol(), KoattyProtocol::Http);
        assert_eq!(ctx.status(), StatusCode::NOT_FOUND);
        assert!(ctx.metadata.is_empty());
        assert!(ctx.rpc.is_none() && ctx.websocket.is_none() && ctx.graphql.is_none());
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let err = create_koatty_context(&app(), BaseContext::default(), "ftp", Inbound::Http)
            .unwrap_err();
        assert!(matches!(err, KoattyError::ContextCreation(_)));
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn websocket_context_carries_message() {
        let ctx = create_koatty_context(
            &app(),
            BaseContext::default(),
            "ws",
            Inbound::WebSocket {
                socket: None,
                message: Bytes::from_static(b"hello"),
            },
        )
        .unwrap();
        assert_eq!(ctx.status(), StatusCode::OK);
        assert_eq!(ctx.get_metadata("_body"), &[MetadataValue::from("hello")]);
    }

    #[test]
    fn grpc_context_imports_call_metadata() {
        let call = Arc::new(FakeCall::new());
        let ctx = create_koatty_context(
            &app(),
            BaseContext::default(),
            "grpc",
            Inbound::Grpc {
                call: Some(call.clone()),
                callback: None,
            },
        )
        .unwrap();

        assert_eq!(ctx.status(), StatusCode::OK);
        assert_eq!(
            ctx.get_metadata("originalPath"),
            &[MetadataValue::from("/pkg.Svc/Method")]
        );
        assert_eq!(
            ctx.get_metadata("authorization"),
            &[MetadataValue::from("token")]
        );
        assert_eq!(
            ctx.get_metadata("_body"),
            &[MetadataValue::Json(json!({ "name": "koatty" }))]
        );
        assert!(ctx.rpc.is_some());

        // Nothing goes back to the peer until a middleware asks for it.
        assert!(call.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn grpc_send_metadata_reaches_call_once() {
        let call = Arc::new(FakeCall::new());
        let mut ctx = create_koatty_context(
            &app(),
            BaseContext::default(),
            "grpc",
            Inbound::Grpc {
                call: Some(call.clone()),
                callback: None,
            },
        )
        .unwrap();

        let mut overlay = Metadata::new();
        overlay.set("x-server", "koatty");
        ctx.send_metadata(Some(&overlay)).unwrap();

        let sent = call.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].get_first("x-server").unwrap().as_str(), Some("koatty"));
        assert!(sent[0].get_first("_body").is_none());
    }

    #[test]
    fn grpc_call_without_payload_stores_empty_body() {
        let mut call = FakeCall::new();
        call.payload = None;
        let ctx = create_koatty_context(
            &app(),
            BaseContext::default(),
            "grpc",
            Inbound::Grpc {
                call: Some(Arc::new(call)),
                callback: None,
            },
        )
        .unwrap();
        assert_eq!(ctx.get_metadata("_body"), &[MetadataValue::Json(json!({}))]);
    }

    #[test]
    fn grpc_handler_path_falls_back_to_inner_call() {
        let mut outer = FakeCall::new();
        outer.handler = None;
        outer.inner = Some(Box::new(FakeCall::new()));
        let ctx = create_koatty_context(
            &app(),
            BaseContext::default(),
            "grpc",
            Inbound::Grpc {
                call: Some(Arc::new(outer)),
                callback: None,
            },
        )
        .unwrap();
        assert_eq!(
            ctx.get_metadata("originalPath"),
            &[MetadataValue::from("/pkg.Svc/Method")]
        );
    }

    #[test]
    fn grpc_without_handler_uses_empty_path() {
        let mut call = FakeCall::new();
        call.handler = None;
        let ctx = create_koatty_context(
            &app(),
            BaseContext::default(),
            "grpc",
            Inbound::Grpc {
                call: Some(Arc::new(call)),
                callback: None,
            },
        )
        .unwrap();
        assert_eq!(ctx.get_metadata("originalPath"), &[MetadataValue::from("")]);
    }

    #[test]
    fn grpc_without_call_is_partially_constructed() {
        let ctx = create_koatty_context(
            &app(),
            BaseContext::default(),
            "grpc",
            Inbound::Http,
        )
        .unwrap();
        assert_eq!(ctx.status(), StatusCode::OK);
        assert!(ctx.rpc.is_none());
        assert!(ctx.metadata.is_empty());
    }

    #[test]
    fn grpc_failure_reaches_callback() {
        let replies: Arc<Mutex<Vec<RpcReply>>> = Arc::default();
        let sink = replies.clone();
        let mut ctx = create_koatty_context(
            &app(),
            BaseContext::default(),
            "grpc",
            Inbound::Grpc {
                call: Some(Arc::new(FakeCall::new())),
                callback: Some(Box::new(move |reply| sink.lock().unwrap().push(reply))),
            },
        )
        .unwrap();

        ctx.on_error(&anyhow::Error::from(koatty_core::Exception::from_status(
            403, None,
        )));
        // Callback fires once even if completion is attempted afterwards.
        ctx.finish_rpc();

        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        let err = replies[0].as_ref().unwrap_err();
        assert_eq!(err.message, "Forbidden");
    }

    #[test]
    fn graphql_context_parses_json_body() {
        let base = BaseContext::new(Method::POST, Uri::from_static("/api/graphql")).with_body(
            json!({
                "query": "query Q($id: ID!) { user(id: $id) { name } }",
                "variables": { "id": "1" },
                "operationName": "Q",
            })
            .to_string(),
        );
        let ctx = create_koatty_context(&app(), base, "graphql", Inbound::Http).unwrap();

        let info = ctx.graphql.as_ref().unwrap();
        assert_eq!(info.operation_name.as_deref(), Some("Q"));
        assert_eq!(info.variables["id"], json!("1"));
        assert_eq!(
            ctx.get_metadata("originalPath"),
            &[MetadataValue::from("/api/graphql")]
        );
        assert_eq!(
            ctx.get_metadata("graphqlOperationName"),
            &[MetadataValue::from("Q")]
        );
    }

    #[test]
    fn graphql_root_path_defaults_to_graphql() {
        let base = BaseContext::new(Method::GET, Uri::from_static("/?query=%7Bping%7D"));
        let ctx = create_koatty_context(&app(), base, "graphql", Inbound::Http).unwrap();
        assert_eq!(
            ctx.get_metadata("originalPath"),
            &[MetadataValue::from("/graphql")]
        );
        assert_eq!(ctx.graphql.as_ref().unwrap().query, "{ping}");
        assert_eq!(
            ctx.get_metadata("graphqlOperationName"),
            &[MetadataValue::from("")]
        );
    }

    #[test]
    fn graphql_send_metadata_filters_internal_keys() {
        let base = BaseContext::new(Method::GET, Uri::from_static("/graphql?query=%7Bping%7D"));
        let mut ctx = create_koatty_context(&app(), base, "graphql", Inbound::Http).unwrap();
        ctx.set_metadata("x-trace", "t1");
        ctx.send_metadata(None).unwrap();

        assert_eq!(ctx.response_header("x-trace"), Some("t1"));
        assert!(ctx.response_header("_body").is_none());
        assert!(ctx.response_header("graphqlquery").is_none());
        assert_eq!(ctx.response_header("originalpath"), Some("/graphql"));
    }
}
