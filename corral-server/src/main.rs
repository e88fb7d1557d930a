use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use corral_server::config::Config;
use corral_server::github::GitHubClient;
use corral_server::live::LiveHub;
use corral_server::state::StateCache;
use corral_server::store::Store;
use corral_server::{hub, intake, state, ui, webhook, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("starting corral coordinator");

    let config = Config::from_env().context("loading configuration")?;
    let store = Store::open(&config.database_path).context("opening assignment store")?;
    let github = GitHubClient::new(
        config.github_token.clone(),
        config.github_org.clone(),
        config.github_repo.clone(),
    );

    // Subscribing is idempotent, so doing it on every boot is safe. Failing
    // here means we would never hear about pull requests: give up.
    let callback = format!("{}/pr-hook", config.base_url.trim_end_matches('/'));
    github
        .create_hook(&callback, &config.hook_secret)
        .await
        .context("creating pull-request hook")?;

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        cache: StateCache::new(),
        live: LiveHub::new(),
        github,
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building http client")?,
    });

    tokio::spawn(state::notify_loop(state.clone()));
    tokio::spawn(state::gc_loop(store));

    let app = Router::new()
        .route("/", get(ui::index))
        .route("/guide.txt", get(ui::guide))
        .route("/static/a.css", get(ui::stylesheet))
        .route("/static/a.js", get(ui::script))
        .route("/result/{id}", get(ui::result_page))
        .route("/live/{*job}", get(ui::live_page))
        .route("/cancel", post(ui::cancel))
        .route("/retry", post(ui::retry))
        .route("/box-ping", post(hub::box_ping))
        .route("/box-longpoll", post(hub::box_longpoll))
        .route("/box-runstatus", post(hub::box_runstatus))
        .route("/box-livepoll", post(hub::box_livepoll))
        .route("/box-livesend", post(hub::box_livesend))
        .merge(webhook::webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state.clone());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("listening on {}", config.listen_addr);

    // The listener is bound, so events delivered from here on queue up
    // behind accept: the initial sync cannot race a missed webhook.
    tokio::spawn(intake::initial_sync(state));

    axum::serve(listener, app).await.context("serving http")
}
