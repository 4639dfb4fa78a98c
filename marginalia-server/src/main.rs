use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::{delete, get, post};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use structopt::StructOpt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod error;
mod extractors;
mod handlers;
mod ledger;
mod pg;
mod service;
mod store;

pub use error::Error;

use extractors::AppState;
use pg::PgStore;
use service::CommentService;

#[derive(Debug, StructOpt)]
#[structopt(name = "marginalia-server", about = "Blog comments API server")]
struct Opt {
    /// Address to listen on
    #[structopt(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Run pending database migrations before serving
    #[structopt(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    tracing_subscriber::fmt::init();

    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&db_url)
        .await
        .context("connecting to the database")?;
    if opt.migrate {
        pg::MIGRATOR
            .run(&pool)
            .await
            .context("running pending migrations")?;
    }

    let comments = Arc::new(CommentService::new(Arc::new(PgStore::new(pool))));
    let app = Router::new()
        .route(
            "/api/posts/:slug/comments",
            get(handlers::thread_comments).post(handlers::create_comment),
        )
        .route("/api/comments", get(handlers::all_comments))
        .route("/api/comments/:id/like", post(handlers::like_comment))
        .route("/api/comments/:id", delete(handlers::delete_comment))
        // the comments widget is embedded on a different origin
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { comments });

    tracing::info!("listening on {}", opt.bind);
    axum::Server::bind(&opt.bind)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("serving axum webserver")
}
