//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::PanelError;
use crate::server::serve::serve;
use crate::workers::{event_watcher, reaper};

/// Run the panel until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PanelError> {
    info!("Initializing dockpanel...");

    let app_state = Arc::new(AppState::init(&options).await?);
    run_with_state(options, app_state, shutdown_signal).await
}

/// Run the workers and the server around an already built state
pub async fn run_with_state(
    options: AppOptions,
    app_state: Arc<AppState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PanelError> {
    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());
    shutdown_manager.with_app_state(app_state.clone())?;

    if let Err(e) = init(&options, app_state, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start dockpanel: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), PanelError> {
    if options.enable_event_watcher {
        init_event_watcher(
            options.event_watcher.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.enable_reaper {
        init_reaper(
            options.reaper.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.enable_socket_server {
        init_socket_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(())
}

fn init_event_watcher(
    options: event_watcher::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PanelError> {
    info!("Initializing event watcher...");

    let runtime = app_state.runtime.clone();
    let events = app_state.events.clone();

    let handle = tokio::spawn(async move {
        event_watcher::run(
            &options,
            runtime.as_ref(),
            events.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_event_watcher_handle(handle)
}

fn init_reaper(
    options: reaper::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PanelError> {
    info!("Initializing session reaper...");

    let sessions = app_state.sessions.clone();

    let handle = tokio::spawn(async move {
        reaper::run(
            &options,
            sessions.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_reaper_handle(handle)
}

async fn init_socket_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PanelError> {
    info!("Initializing HTTP server...");

    let server_state = Arc::new(app_state.server_state());
    let handle = serve(&options.server, server_state, async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    socket_server_handle: Option<JoinHandle<Result<(), PanelError>>>,
    reaper_handle: Option<JoinHandle<()>>,
    event_watcher_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            socket_server_handle: None,
            reaper_handle: None,
            event_watcher_handle: None,
        }
    }

    fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), PanelError> {
        if self.app_state.is_some() {
            return Err(PanelError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    fn with_reaper_handle(&mut self, handle: JoinHandle<()>) -> Result<(), PanelError> {
        if self.reaper_handle.is_some() {
            return Err(PanelError::ShutdownError("reaper_handle already set".to_string()));
        }
        self.reaper_handle = Some(handle);
        Ok(())
    }

    fn with_event_watcher_handle(&mut self, handle: JoinHandle<()>) -> Result<(), PanelError> {
        if self.event_watcher_handle.is_some() {
            return Err(PanelError::ShutdownError(
                "event_watcher_handle already set".to_string(),
            ));
        }
        self.event_watcher_handle = Some(handle);
        Ok(())
    }

    fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), PanelError>>,
    ) -> Result<(), PanelError> {
        if self.socket_server_handle.is_some() {
            return Err(PanelError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), PanelError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), PanelError> {
        info!("Shutting down dockpanel...");

        // 1. Socket server, so no new jobs or sessions start
        if let Some(handle) = self.socket_server_handle.take() {
            handle.await.map_err(|e| PanelError::ShutdownError(e.to_string()))??;
        }

        // 2. Event watcher
        if let Some(handle) = self.event_watcher_handle.take() {
            handle.await.map_err(|e| PanelError::ShutdownError(e.to_string()))?;
        }

        // 3. Session reaper, closes open sessions
        if let Some(handle) = self.reaper_handle.take() {
            handle.await.map_err(|e| PanelError::ShutdownError(e.to_string()))?;
        }

        // 4. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
