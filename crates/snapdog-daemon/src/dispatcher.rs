//! Command/Status bus: routes typed commands to the owning engine and owns
//! the system-level commands (catalogue reload).
//!
//! Commands targeting one engine are serialized through that engine's
//! channel; `dispatch` resolves once the engine has applied the mutation and
//! enqueued the resulting status events.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use snapdog_core::catalogue::Catalogue;
use snapdog_core::command::{CommandEnvelope, CommandTarget, StatusEvent};
use snapdog_core::{Error, Result};

use crate::notify::Publisher;

/// A routed command plus the caller's completion channel.
pub struct EngineRequest {
    pub env: CommandEnvelope,
    pub reply: oneshot::Sender<Result<()>>,
}

impl EngineRequest {
    pub fn new(env: CommandEnvelope) -> (Self, oneshot::Receiver<Result<()>>) {
        let (reply, rx) = oneshot::channel();
        (Self { env, reply }, rx)
    }
}

/// Atomically replaceable ETS catalogue, shared by the KNX service and the
/// system command path.
pub struct CatalogueStore {
    csv_path: Option<String>,
    current: RwLock<Arc<Catalogue>>,
}

impl CatalogueStore {
    pub async fn load(csv_path: Option<String>) -> Result<Arc<Self>> {
        let catalogue = match &csv_path {
            Some(path) => Catalogue::load(std::path::Path::new(path)).await?,
            None => Catalogue::default(),
        };
        info!("catalogue: {} group addresses", catalogue.len());
        Ok(Arc::new(Self {
            csv_path,
            current: RwLock::new(Arc::new(catalogue)),
        }))
    }

    pub async fn get(&self) -> Arc<Catalogue> {
        self.current.read().await.clone()
    }

    /// Reload from disk; readers see either the old or the new set.
    pub async fn reload(&self) -> Result<usize> {
        let Some(path) = &self.csv_path else {
            return Err(Error::invalid_state("no catalogue CSV configured"));
        };
        let fresh = Catalogue::load(std::path::Path::new(path)).await?;
        let entries = fresh.len();
        *self.current.write().await = Arc::new(fresh);
        info!("catalogue: reloaded {entries} group addresses");
        Ok(entries)
    }
}

pub struct Dispatcher {
    zones: HashMap<usize, mpsc::Sender<EngineRequest>>,
    clients: Option<mpsc::Sender<EngineRequest>>,
    catalogue: Arc<CatalogueStore>,
    publisher: Publisher,
}

impl Dispatcher {
    pub fn new(
        zones: HashMap<usize, mpsc::Sender<EngineRequest>>,
        clients: Option<mpsc::Sender<EngineRequest>>,
        catalogue: Arc<CatalogueStore>,
        publisher: Publisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            zones,
            clients,
            catalogue,
            publisher,
        })
    }

    /// Route a command to its owner and wait for the mutation to land.
    /// Failures are also mirrored onto the status bus as error events.
    pub async fn dispatch(&self, env: CommandEnvelope) -> Result<()> {
        let id = env.id;
        debug!("dispatch {} from {:?}: {:?}", id, env.source, env.command);
        let result = self.route(env).await;
        if let Err(e) = &result {
            if !matches!(e, Error::Cancelled) {
                self.publisher.publish_error(e, Some(id)).await;
            }
        }
        result
    }

    async fn route(&self, env: CommandEnvelope) -> Result<()> {
        match env.command.target() {
            CommandTarget::Zone(zone) => {
                let tx = self
                    .zones
                    .get(&zone)
                    .ok_or_else(|| Error::not_found(format!("zone {zone}")))?;
                let (request, rx) = EngineRequest::new(env);
                tx.send(request)
                    .await
                    .map_err(|_| Error::invalid_state(format!("zone {zone} engine stopped")))?;
                rx.await.map_err(|_| Error::Cancelled)?
            }
            CommandTarget::Client(mac) => {
                let tx = self
                    .clients
                    .as_ref()
                    .ok_or_else(|| Error::not_found(format!("client {mac}")))?;
                let (request, rx) = EngineRequest::new(env);
                tx.send(request)
                    .await
                    .map_err(|_| Error::invalid_state("client engine stopped"))?;
                rx.await.map_err(|_| Error::Cancelled)?
            }
            CommandTarget::System => {
                let entries = self.catalogue.reload().await?;
                self.publisher
                    .publish(StatusEvent::CatalogueReloaded { entries })
                    .await;
                Ok(())
            }
        }
    }
}
