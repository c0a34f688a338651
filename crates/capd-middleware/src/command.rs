//! The broker task's inbound queue.
//!
//! Bus method calls, client disconnects and OS signals all end up as a
//! [`BrokerCommand`] on one bounded mpsc channel.  The broker processes them
//! strictly in arrival order, which is what keeps lease counts race-free
//! without any locking.
//!
//! Callers hold a cloneable [`BrokerHandle`]; methods that need an answer
//! carry a oneshot reply sender inside the command.

use std::collections::BTreeMap;

use capd_types::{BrokerError, ClientId, EndpointPath};
use tokio::sync::{mpsc, oneshot};

/// One unit of work for the broker task.
#[derive(Debug)]
pub enum BrokerCommand {
    /// `requestAPI(name)` from `client`.
    RequestApi {
        name: String,
        client: ClientId,
        reply: oneshot::Sender<Option<EndpointPath>>,
    },
    /// `releaseAPI(name)` from `client`.
    ReleaseApi {
        name: String,
        client: ClientId,
        reply: oneshot::Sender<()>,
    },
    /// `listActive()`.
    ListActive {
        reply: oneshot::Sender<BTreeMap<String, EndpointPath>>,
    },
    /// A bus client asked the broker to exit.
    ExitRequest { client: ClientId, exit_code: i32 },
    /// The process received a termination signal.
    Signal(i32),
    /// The bus reported that `client`'s connection is gone.
    ClientVanished(ClientId),
}

impl BrokerCommand {
    /// Short name used for the span the broker opens per command.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerCommand::RequestApi { .. } => "requestAPI",
            BrokerCommand::ReleaseApi { .. } => "releaseAPI",
            BrokerCommand::ListActive { .. } => "listActive",
            BrokerCommand::ExitRequest { .. } => "exit",
            BrokerCommand::Signal(_) => "signal",
            BrokerCommand::ClientVanished(_) => "clientVanished",
        }
    }
}

/// A change of owner for a bus name, as reported by the bus daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChange {
    /// The bus name whose owner changed.
    pub name: String,
    pub old_owner: Option<ClientId>,
    pub new_owner: Option<ClientId>,
}

impl OwnershipChange {
    /// The connection that just went away, if this change reports one.
    pub fn vanished(&self) -> Option<ClientId> {
        match self.new_owner {
            None => Some(ClientId::new(self.name.clone())),
            Some(_) => None,
        }
    }
}

/// Cloneable sender side of the broker queue.
#[derive(Clone, Debug)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    /// Create a handle and the receiver the broker task consumes.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<BrokerCommand>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    pub async fn request_api(
        &self,
        name: impl Into<String>,
        client: ClientId,
    ) -> Result<Option<EndpointPath>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerCommand::RequestApi {
            name: name.into(),
            client,
            reply,
        })
        .await?;
        rx.await.map_err(|e| BrokerError::Channel(format!("broker dropped reply: {e}")))
    }

    pub async fn release_api(&self, name: impl Into<String>, client: ClientId) -> Result<(), BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerCommand::ReleaseApi {
            name: name.into(),
            client,
            reply,
        })
        .await?;
        rx.await.map_err(|e| BrokerError::Channel(format!("broker dropped reply: {e}")))
    }

    pub async fn list_active(&self) -> Result<BTreeMap<String, EndpointPath>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerCommand::ListActive { reply }).await?;
        rx.await.map_err(|e| BrokerError::Channel(format!("broker dropped reply: {e}")))
    }

    pub async fn request_exit(&self, client: ClientId, exit_code: i32) -> Result<(), BrokerError> {
        self.send(BrokerCommand::ExitRequest { client, exit_code }).await
    }

    /// Queue a termination signal for the broker task.
    pub async fn signal(&self, signal: i32) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Signal(signal)).await
    }

    /// Report a client whose connection went away.  Queued behind every
    /// call the client made before it vanished.
    pub async fn client_vanished(&self, client: ClientId) -> Result<(), BrokerError> {
        self.send(BrokerCommand::ClientVanished(client)).await
    }

    async fn send(&self, command: BrokerCommand) -> Result<(), BrokerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| BrokerError::Channel("broker task is gone".to_string()))
    }
}
