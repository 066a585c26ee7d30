//! Minimal Koatty application answering every request with "Hello, World!".

use clap::Parser;
use koatty::logging::init_tracing;
use koatty::{HttpServer, InitOptions, Koatty, KoattyProtocol, ServerConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "koatty-hello", version, about = "Serve Hello, World! over http or ws")]
struct Args {
    #[arg(long, env = "KOATTY_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "KOATTY_PORT", default_value_t = 3000)]
    port: u16,

    /// One of http, ws, graphql.
    #[arg(long, env = "KOATTY_PROTOCOL", default_value = "http")]
    protocol: KoattyProtocol,

    #[arg(long, env = "KOATTY_DEBUG")]
    debug: bool,

    /// Prepend the tracing middleware.
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let app = Koatty::new(InitOptions {
        name: "koatty-hello".to_string(),
        app_debug: args.debug,
        trace: args.trace,
        ..InitOptions::default()
    });
    app.use_fn(|ctx, next| {
        Box::pin(async move {
            ctx.set_body("Hello, World!");
            next.run(ctx).await
        })
    });

    app.bind_server(HttpServer::new(ServerConfig::new(args.protocol, args.host, args.port)))
        .await;
    let addrs = app
        .listen(|app| info!(name = %app.name, env = %app.env, "ready"))
        .await?;
    info!(?addrs, "listening, press ctrl-c to stop");

    app.wait_for_stop().await;
    Ok(())
}
