//! The kidslockd service: IPC command handling around the reconciler

use anyhow::{Context, Result};
use kidslock_api::{
    AuditEntryView, ClientRole, Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus,
    Response, ResponsePayload,
};
use kidslock_config::Policy;
use kidslock_core::{CoreEvent, DriverSettings, EngineError, EngineSettings, ReconcileEngine, Reconciler};
use kidslock_device_api::{ReachabilityProber, RemoteControl};
use kidslock_ipc::{IpcServer, ServerMessage};
use kidslock_store::{AuditEvent, AuditEventType, Store};
use kidslock_util::{ClientId, RateLimiter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::IpcPublisher;

/// Largest audit page a client may ask for
const MAX_RECENT_EVENTS: usize = 500;

/// Main service state
pub struct Service {
    reconciler: Reconciler,
    ipc: Arc<IpcServer>,
    publisher: Arc<IpcPublisher>,
    store: Arc<dyn Store>,
    rate_limiter: RateLimiter,
    core_events: mpsc::UnboundedReceiver<CoreEvent>,
}

impl Service {
    /// Load persisted devices, seed the configured ones and start listening
    pub async fn new(
        policy: Policy,
        socket_path: &Path,
        store: Arc<dyn Store>,
        prober: Arc<dyn ReachabilityProber>,
        remote: Arc<dyn RemoteControl>,
    ) -> Result<Self> {
        let mut engine = ReconcileEngine::new(store.clone(), EngineSettings::from(&policy.service));
        let loaded = engine.load().context("Failed to load devices from store")?;
        engine.seed(&policy.devices, kidslock_util::now().date_naive());

        info!(
            loaded,
            configured = policy.devices.len(),
            total = engine.device_count(),
            "Device registry ready"
        );

        let mut ipc = IpcServer::new(socket_path);
        ipc.start()
            .await
            .with_context(|| format!("Failed to bind IPC socket {:?}", socket_path))?;
        let ipc = Arc::new(ipc);

        let publisher = Arc::new(IpcPublisher::new(ipc.clone()));
        let (events_tx, core_events) = mpsc::unbounded_channel();
        let reconciler = Reconciler::new(
            Arc::new(Mutex::new(engine)),
            prober,
            remote,
            publisher.clone(),
            DriverSettings::from(&policy.service),
        )
        .with_events(events_tx);

        // Rate limiter: 30 requests per second per client
        let rate_limiter = RateLimiter::new(30, Duration::from_secs(1));

        Ok(Self {
            reconciler,
            ipc,
            publisher,
            store,
            rate_limiter,
            core_events,
        })
    }

    /// Serve until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ipc_messages = self
            .ipc
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        if let Err(e) = self.store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted)) {
            warn!(error = %e, "Failed to log service start");
        }

        let ipc_accept = self.ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let ticker = tokio::spawn(self.reconciler.clone().run(shutdown.clone()));

        info!("Service running");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                Some(msg) = ipc_messages.recv() => {
                    self.handle_ipc_message(msg).await;
                }

                Some(event) = self.core_events.recv() => {
                    self.handle_core_event(event);
                }
            }
        }

        info!("Shutting down kidslockd");

        if let Err(e) = ticker.await {
            warn!(error = %e, "Reconciler task ended abnormally");
        }

        self.ipc.broadcast_event(Event::new(EventPayload::Shutdown));

        if let Err(e) = self.store.append_audit(AuditEvent::new(AuditEventType::ServiceStopped)) {
            warn!(error = %e, "Failed to log service shutdown");
        }

        info!("Shutdown complete");
        Ok(())
    }

    fn handle_core_event(&self, event: CoreEvent) {
        let payload = match event {
            CoreEvent::LockChanged {
                device_id,
                locked,
                reason,
            } => EventPayload::LockChanged {
                device_id,
                locked,
                reason,
            },
            CoreEvent::CommandFailed {
                device_id,
                locked,
                error,
            } => EventPayload::CommandFailed {
                device_id,
                locked,
                error,
            },
        };
        self.ipc.broadcast_event(Event::new(payload));
    }

    async fn handle_ipc_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                if !self.rate_limiter.check(&client_id) {
                    let response = Response::error(
                        request.request_id,
                        ErrorInfo::new(ErrorCode::RateLimited, "Too many requests"),
                    );
                    let _ = self.ipc.send_response(&client_id, response).await;
                    return;
                }

                let response = self
                    .handle_command(&client_id, request.request_id, request.command)
                    .await;

                if let Err(e) = self.ipc.send_response(&client_id, response).await {
                    debug!(client_id = %client_id, error = %e, "Client went away before response");
                }
            }

            ServerMessage::ClientConnected { client_id, info } => {
                debug!(client_id = %client_id, role = ?info.role, uid = ?info.uid, "Client registered");

                let _ = self.store.append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                    client_id: client_id.to_string(),
                    role: format!("{:?}", info.role),
                    uid: info.uid,
                }));
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::ClientDisconnected {
                        client_id: client_id.to_string(),
                    },
                ));

                self.rate_limiter.remove_client(&client_id);
            }
        }
    }

    async fn handle_command(&self, client_id: &ClientId, request_id: u64, command: Command) -> Response {
        let now = kidslock_util::now();

        if command.is_mutating() {
            let role = self
                .ipc
                .get_client_info(client_id)
                .await
                .map(|info| info.role)
                .unwrap_or(ClientRole::Observer);
            if !role.can_mutate() {
                return Response::error(
                    request_id,
                    ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
                );
            }
        }

        let reconciler = &self.reconciler;
        let device = |result: Result<_, EngineError>| match result {
            Ok(device) => Response::success(request_id, ResponsePayload::Device { device }),
            Err(e) => engine_error(request_id, e),
        };

        match command {
            Command::GetState => {
                let state = reconciler.engine().lock().await.snapshot(now);
                Response::success(request_id, ResponsePayload::State(state))
            }

            Command::ListDevices => {
                let devices = reconciler.engine().lock().await.list_devices(now);
                Response::success(request_id, ResponsePayload::Devices { devices })
            }

            Command::GetDevice { device_id } => {
                device(reconciler.engine().lock().await.device_view(&device_id, now))
            }

            Command::CreateDevice { device: definition } => {
                device(reconciler.create_device(definition, now).await)
            }

            Command::UpdateDevice { device: definition } => {
                device(reconciler.update_device(definition, now).await)
            }

            Command::DeleteDevice { device_id } => match reconciler.delete_device(&device_id).await {
                Ok(()) => Response::success(request_id, ResponsePayload::DeviceDeleted { device_id }),
                Err(e) => engine_error(request_id, e),
            },

            Command::ToggleLock { device_id } => device(reconciler.toggle_lock(&device_id, now).await),

            Command::SetLock { device_id, locked } => {
                device(reconciler.set_lock(&device_id, locked, now).await)
            }

            Command::AddTime { device_id, minutes } => {
                if minutes == 0 {
                    return Response::error(
                        request_id,
                        ErrorInfo::new(ErrorCode::InvalidRequest, "minutes must be positive"),
                    );
                }
                device(reconciler.add_time(&device_id, minutes, now).await)
            }

            Command::ResetDay { device_id } => device(reconciler.reset_day(&device_id, now).await),

            Command::ResumeAutomatic { device_id } => {
                device(reconciler.resume_automatic(&device_id, now).await)
            }

            Command::GetRecentEvents { limit } => {
                let audits = reconciler
                    .engine()
                    .lock()
                    .await
                    .recent_audits(limit.min(MAX_RECENT_EVENTS));
                match audits {
                    Ok(audits) => {
                        let events = audits
                            .into_iter()
                            .map(|a| AuditEntryView {
                                id: a.id,
                                timestamp: a.timestamp,
                                event: serde_json::to_value(&a.event).unwrap_or(serde_json::Value::Null),
                            })
                            .collect();
                        Response::success(request_id, ResponsePayload::RecentEvents { events })
                    }
                    Err(e) => engine_error(request_id, e),
                }
            }

            Command::SubscribeEvents => Response::success(
                request_id,
                ResponsePayload::Subscribed {
                    client_id: client_id.clone(),
                    retained: self.publisher.retained().await,
                },
            ),

            Command::UnsubscribeEvents => Response::success(request_id, ResponsePayload::Unsubscribed),

            Command::GetHealth => {
                let engine = reconciler.engine().lock().await;
                let store_ok = engine.store_healthy();
                let health = HealthStatus {
                    live: true,
                    ready: store_ok && engine.last_tick_at().is_some(),
                    store_ok,
                    device_count: engine.device_count(),
                    last_tick: engine.last_tick_at(),
                };
                Response::success(request_id, ResponsePayload::Health(health))
            }

            Command::Ping => Response::success(request_id, ResponsePayload::Pong),
        }
    }
}

fn engine_error(request_id: u64, e: EngineError) -> Response {
    let code = match &e {
        EngineError::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
        EngineError::DeviceExists(_) => ErrorCode::DeviceExists,
        EngineError::InvalidDefinition(_) => ErrorCode::ValidationFailed,
        EngineError::Store(_) => ErrorCode::StoreError,
    };
    Response::error(request_id, ErrorInfo::new(code, e.to_string()))
}
