use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::call::machine::{CallMachine, Command};
use crate::call::{ClientEvent, Snapshot};
use crate::config::Config;
use crate::error::ClientError;
use crate::identity::{Identity, Storage};
use crate::media::{MediaDevices, MediaKind, PreviewSink};
use crate::signaling::Transport;

// a lazy version of the builder pattern
pub struct ClientArgs {
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub devices: Arc<dyn MediaDevices>,
    pub preview: Box<dyn PreviewSink>,
    pub storage: Box<dyn Storage>,
}

/// Handle to a call client running in a background task.
///
/// Every method is a command answered by the task once it has been applied.
/// Everything else the client has to say (state changes, incoming calls,
/// elapsed time, notices) arrives on the event receiver returned by
/// [`Client::start`]. Dropping every clone of the handle shuts the client down.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
}

impl Client {
    /// Spawns the client task. Must be called from within a tokio runtime.
    pub fn start(args: ClientArgs) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let machine = CallMachine::new(args, commands_rx, events_tx);
        tokio::spawn(machine.run());
        (
            Self {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    /// validates `identifier` and starts connecting with it
    pub async fn login(&self, identifier: &str) -> Result<Identity, ClientError> {
        let raw = identifier.to_owned();
        self.request(|reply| Command::Login { raw, reply }).await?
    }

    /// ends any call, drops the connection and forgets the saved identity
    pub async fn logout(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Logout { reply }).await?
    }

    /// Places a call. When no local media is held yet it is acquired first;
    /// failures along the way are reported as notices.
    pub async fn call(&self, identifier: &str, kind: MediaKind) -> Result<(), ClientError> {
        let raw = identifier.to_owned();
        self.request(|reply| Command::Call { raw, kind, reply }).await?
    }

    pub async fn accept_inbound(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    pub async fn reject_inbound(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    /// ends the current call; does nothing when there is none
    pub async fn hang_up(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::HangUp { reply }).await?
    }

    /// flips the microphone and returns whether it is now enabled
    pub async fn toggle_audio(&self) -> Result<bool, ClientError> {
        self.request(|reply| Command::ToggleAudio { reply }).await?
    }

    /// flips the camera and returns whether it is now enabled
    pub async fn toggle_video(&self) -> Result<bool, ClientError> {
        self.request(|reply| Command::ToggleVideo { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot, ClientError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// recent contacts, most recent first
    pub async fn contacts(&self) -> Result<Vec<Identity>, ClientError> {
        self.request(|reply| Command::Contacts { reply }).await
    }

    /// stops the client; the saved identity is kept for the next start
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }
}
