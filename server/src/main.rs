mod app;
mod coalesce;
mod config;
mod error;
mod facade;
mod http;
mod motion;
mod queue;
mod serial;
mod servo;
mod session;
mod spatial;
mod svg;
mod ws;

use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tracing::info;

use app::AppState;
use coalesce::Coalescer;
use config::Config;
use facade::AxiDrawFacade;
use queue::{CommandsProcessor, JobQueue};
use serial::SerialDriver;
use session::SessionCoordinator;
use spatial::{SpatialConfig, SpatialProcessor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plotter_server=info,tower_http=warn".into()),
        )
        .init();

    let config = Config::from_env();
    info!(version = env!("CARGO_PKG_VERSION"), "plotter-server starting");

    let driver = SerialDriver::spawn();
    let facade = AxiDrawFacade::new(driver, config.clone());
    let spatial = SpatialProcessor::new(SpatialConfig::default());
    let sessions = SessionCoordinator::new();

    let move_facade = facade.clone();
    let coalesce_move = Coalescer::new(Arc::new(move |dx, dy, units| {
        let facade = move_facade.clone();
        Box::pin(async move {
            facade.move_xy(dx, dy, units, None, None).await?;
            Ok(facade.position().await)
        })
    }));

    let lineto_facade = facade.clone();
    let coalesce_lineto = Coalescer::new(Arc::new(move |dx, dy, units| {
        let facade = lineto_facade.clone();
        Box::pin(async move {
            facade.line_to(dx, dy, units, None, None).await?;
            Ok(facade.position().await)
        })
    }));

    let job_facade = facade.clone();
    let processor = Arc::new(CommandsProcessor {
        execute_one: Arc::new(move |cmd| {
            let facade = job_facade.clone();
            Box::pin(async move { facade.execute(vec![cmd]).await.map_err(|e| e.to_string()) })
                as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>
        }),
    });
    let (queue, queue_updates) = JobQueue::spawn(processor);

    if config.autoconnect {
        let boot_facade = facade.clone();
        let device = config.default_device.clone();
        tokio::spawn(async move {
            if let Err(err) = boot_facade.ensure_ready(device).await {
                tracing::warn!(%err, "autoconnect failed");
            }
        });
    }

    // Relay facade state/path events and queue updates onto the shared
    // session broadcast bus so every connected client sees them.
    let event_sessions = sessions.clone();
    let event_facade = facade.clone();
    tokio::spawn(async move {
        let mut events = event_facade.subscribe_events();
        while let Ok(event) = events.recv().await {
            let message = match event {
                facade::FacadeEvent::StateChanged(state) => serde_json::json!({ "type": "serial_state", "state": state }),
                facade::FacadeEvent::PathUpdate(point) => serde_json::json!({ "type": "path_update", "point": point }),
            };
            event_sessions.broadcast(None, message);
        }
    });

    let queue_sessions = sessions.clone();
    let mut queue_updates = queue_updates;
    tokio::spawn(async move {
        while queue_updates.recv().await.is_some() {
            queue_sessions.broadcast(None, serde_json::json!({ "type": "queue_update" }));
        }
    });

    let spatial = Arc::new(spatial);
    let spatial_sessions = sessions.clone();
    let event_spatial = spatial.clone();
    tokio::spawn(async move {
        let mut states = event_spatial.subscribe_state();
        while let Ok(state) = states.recv().await {
            spatial_sessions.broadcast(None, serde_json::json!({ "type": "state", "state": state }));
        }
    });

    let state = AppState {
        facade,
        spatial,
        sessions,
        queue,
        coalesce_move,
        coalesce_lineto,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let static_service = ServeDir::new(&config.static_root)
        .not_found_service(ServeFile::new(format!("{}/index.html", config.static_root)));

    let app = axum::Router::new()
        .merge(http::router())
        .route("/spatial", axum::routing::get(ws::ws_handler))
        .fallback_service(static_service)
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
