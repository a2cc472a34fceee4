//! Clients API: the pages a worker controls.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::lifecycle::ServiceWorkerId;
use crate::{Result, ServiceWorkerError};

/// A client (open page or worker).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker whose fetch handler sees this client's requests.
    pub controller: Option<ServiceWorkerId>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Options for clients.matchAll().
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    /// Also return clients not controlled by `controlled_by`.
    pub include_uncontrolled: bool,
    /// Worker asking; only meaningful with `include_uncontrolled == false`.
    pub controlled_by: Option<ServiceWorkerId>,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Match all clients.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller == options.controlled_by)
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect()
    }

    /// Open an uncontrolled window client.
    pub fn open_window(&mut self, url: &str) -> Result<Client> {
        let url = Url::parse(url)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("client url {url}: {e}")))?;

        let client = Client {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            controller: None,
        };

        self.clients.insert(client.id.clone(), client.clone());
        Ok(client)
    }

    /// `clients.claim()`: make `worker` the controller of every window client
    /// inside `scope`. Returns the ids whose controller changed.
    pub fn claim(&mut self, scope: &Url, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed = Vec::new();
        for client in self.clients.values_mut() {
            if client.client_type != ClientType::Window
                || !client.url.as_str().starts_with(scope.as_str())
                || client.controller == Some(worker)
            {
                continue;
            }
            debug!(client = %client.id, worker = worker.raw(), "Client claimed");
            client.controller = Some(worker);
            changed.push(client.id.clone());
        }
        changed
    }

    /// Drop `worker` as controller everywhere.
    pub fn release(&mut self, worker: ServiceWorkerId) -> usize {
        let mut released = 0;
        for client in self.clients.values_mut() {
            if client.controller == Some(worker) {
                client.controller = None;
                released += 1;
            }
        }
        released
    }

    /// Ids of the clients `worker` controls.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> Vec<&str> {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .map(|c| c.id.as_str())
            .collect()
    }

    /// Controller of a client, if any.
    pub fn controller_of(&self, id: &str) -> Option<ServiceWorkerId> {
        self.clients.get(id).and_then(|c| c.controller)
    }

    /// Set the controller of one client.
    pub fn set_controller(&mut self, id: &str, worker: Option<ServiceWorkerId>) -> Result<()> {
        let client = self
            .clients
            .get_mut(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))?;
        client.controller = worker;
        Ok(())
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:08x}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
