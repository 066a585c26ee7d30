//! Websocket round trip over a real socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use koatty::server::ServerStatus;
use koatty::{HttpServer, InitOptions, Koatty, KoattyProtocol, KoattyServer, ServerConfig};
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn message_body_is_sent_back() {
    let app = Koatty::new(InitOptions::default());
    app.use_fn(|ctx, next| {
        Box::pin(async move {
            let incoming = ctx
                .get_metadata("_body")
                .first()
                .map(ToString::to_string)
                .unwrap_or_default();
            ctx.set_body(format!("echo: {incoming}"));
            next.run(ctx).await
        })
    });

    let mut server = HttpServer::new(ServerConfig::new(KoattyProtocol::Ws, "127.0.0.1", 0));
    let addr = server.start(app).await.unwrap();
    let registry = server.registry();

    let (mut socket, _response) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat"))
        .await
        .unwrap();

    socket.send(Message::text("hello")).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "echo: hello");
    assert_eq!(registry.count(), 1);

    server.stop().await.unwrap();
    assert_eq!(server.status(), ServerStatus::Stopped);

    // The server closes the connection on stop.
    let closing = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closing.is_ok());
}

#[tokio::test]
async fn listen_drives_websocket_binding() {
    let app = Koatty::new(InitOptions::default());
    app.use_fn(|ctx, next| {
        Box::pin(async move {
            ctx.set_body("pong");
            next.run(ctx).await
        })
    });
    app.bind_server(HttpServer::new(ServerConfig::new(KoattyProtocol::Ws, "127.0.0.1", 0)))
        .await;

    let addrs = app.listen(|_| {}).await.unwrap();
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addrs[0]))
        .await
        .unwrap();
    socket.send(Message::binary(b"ping".to_vec())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "pong");

    app.stop().await.unwrap();
    app.wait_for_stop().await;
}
