use std::path::PathBuf;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use governor_engine::{configure, SessionRegistry};
use load_governor::Profile;
use tokio::runtime::Handle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "governor-engine", version, about = "Serve load-governor sessions over HTTP")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,
    /// Profile whose control settings new sessions use.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let path = args.config.unwrap_or_else(Profile::default_path);
    let profile = Profile::load_or_default(&path).with_context(|| format!("loading profile {}", path.display()))?;
    let registry = web::Data::new(SessionRegistry::new(Handle::current(), profile.control));

    info!(bind = %args.bind, "starting engine");
    let app_registry = registry.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .app_data(app_registry.clone())
            .configure(configure)
    })
    .bind(&args.bind)
    .with_context(|| format!("binding {}", args.bind))?
    .run()
    .await?;

    registry.shutdown().await;
    Ok(())
}
