//! [`BrokerLoop`] – the single task that owns all lease state.
//!
//! The loop selects over two inputs and handles one item at a time:
//!
//! 1. **Commands** – bus method calls, client disconnects, bus exit
//!    requests and OS signals, all queued as [`BrokerCommand`]s in arrival
//!    order.  Disconnects go to the [`CrashReclaimer`].
//! 2. **Watchdog ticks** – from the [`LivenessSupervisor`].
//!
//! Every lease transition is turned into bus effects in a fixed order:
//!
//! | Transition | Effects |
//! |---|---|
//! | Activated | publish endpoint, emit `apiAvailable`, broadcast on the [`EventBus`] |
//! | Deactivated | unpublish endpoint, emit `apiUnavailable`, broadcast on the [`EventBus`] |
//!
//! Effect failures are logged; the lease state is authoritative and is
//! never rolled back.  An endpoint whose publish failed is published again
//! on the next granted request.
//!
//! # Lifecycle
//!
//! ```text
//! STATUS=startup ─► module startup ─► watchdog armed ─► STATUS=running, READY=1
//!     ─► … commands … ─► first shutdown signal
//!     ─► watchdog cancelled ─► STATUS=stopping, STOPPING=1 ─► aboutToQuit
//!     ─► every module disabled, every endpoint unpublished ─► name released
//! ```
//!
//! While the teardown runs the loop keeps draining commands, so a second
//! signal reaches the [`ShutdownCoordinator`] and kills the process.

use std::collections::BTreeSet;
use std::sync::Arc;

use capd_kernel::{Registry, ShutdownAction, ShutdownCoordinator, ShutdownOrigin, Transition};
use capd_middleware::{BrokerCommand, EndpointHost, EventBus, InitNotifier, NotifyState};
use capd_types::{BrokerEvent, CapabilityKind, ClientId, EndpointPath, Event};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::liveness::LivenessSupervisor;
use crate::reclaimer::CrashReclaimer;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// `source` of every event the broker puts on the [`EventBus`].
const EVENT_SOURCE: &str = "capd-runtime::broker";

/// Exit code used when every command sender is gone.
const EXIT_COMMANDS_CLOSED: i32 = 1;

/// Called on a second shutdown request.  Does not return in production.
pub type ForceKill = Box<dyn Fn() + Send + Sync>;

/// Send SIGKILL to this process.
pub fn kill_self() {
    if let Err(e) = kill(Pid::this(), Signal::SIGKILL) {
        error!(error = %e, "SIGKILL to self failed, aborting");
        std::process::abort();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BrokerLoop
// ─────────────────────────────────────────────────────────────────────────────

pub struct BrokerLoop {
    registry: Registry,
    host: Arc<dyn EndpointHost>,
    notifier: Arc<dyn InitNotifier>,
    events: EventBus,
    shutdown: ShutdownCoordinator,
    reclaimer: CrashReclaimer,
    commands: mpsc::Receiver<BrokerCommand>,
    /// Capabilities whose endpoint object is currently on the bus.
    published: BTreeSet<CapabilityKind>,
    force_kill: ForceKill,
}

impl BrokerLoop {
    pub fn new(
        registry: Registry,
        host: Arc<dyn EndpointHost>,
        notifier: Arc<dyn InitNotifier>,
        commands: mpsc::Receiver<BrokerCommand>,
    ) -> Self {
        Self {
            registry,
            host,
            notifier,
            events: EventBus::default(),
            shutdown: ShutdownCoordinator::new(),
            reclaimer: CrashReclaimer::new(),
            commands,
            published: BTreeSet::new(),
            force_kill: Box::new(kill_self),
        }
    }

    /// Broadcast broker events on `events` instead of a private bus.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Replace what a second shutdown request does.
    pub fn with_force_kill(mut self, force_kill: impl Fn() + Send + Sync + 'static) -> Self {
        self.force_kill = Box::new(force_kill);
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Run until the shutdown sequence completes.  Returns the exit code
    /// the process should terminate with.
    #[instrument(name = "broker", skip_all)]
    pub async fn run(mut self) -> i32 {
        self.notify(NotifyState::Status("startup".to_string()));
        self.registry.startup();
        let mut liveness = LivenessSupervisor::start(self.notifier.as_ref());
        self.notify(NotifyState::Status("running".to_string()));
        self.notify(NotifyState::Ready);
        info!(
            capabilities = self.registry.capabilities().count(),
            "broker running"
        );

        let exit_code = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(exit_code) = self.handle(command).await {
                            break exit_code;
                        }
                    }
                    None => {
                        warn!("command queue closed, shutting down");
                        break EXIT_COMMANDS_CLOSED;
                    }
                },
                () = liveness.tick() => liveness.beat(self.notifier.as_ref()),
            }
        };

        liveness.cancel();
        self.teardown(exit_code).await
    }

    // ── Command handling ─────────────────────────────────────────────────────

    /// Handle one command.  Returns the exit code once shutdown begins.
    #[instrument(name = "command", skip_all, fields(kind = command.kind()))]
    async fn handle(&mut self, command: BrokerCommand) -> Option<i32> {
        match command {
            BrokerCommand::RequestApi { name, client, reply } => {
                let path = self.request_api(&name, &client).await;
                let _ = reply.send(path);
            }
            BrokerCommand::ReleaseApi { name, client, reply } => {
                self.release_api(&name, &client).await;
                let _ = reply.send(());
            }
            BrokerCommand::ListActive { reply } => {
                let active = self
                    .registry
                    .list_active()
                    .into_iter()
                    .map(|(kind, path)| (kind.as_str().to_string(), path))
                    .collect();
                let _ = reply.send(active);
            }
            BrokerCommand::ExitRequest { client, exit_code } => {
                self.shutdown.request(ShutdownOrigin::Bus { client, exit_code });
            }
            BrokerCommand::Signal(signal) => {
                match self.shutdown.request(ShutdownOrigin::Signal(signal)) {
                    ShutdownAction::Begin { exit_code } => return Some(exit_code),
                    ShutdownAction::ForceKill => (self.force_kill)(),
                    ShutdownAction::Rejected => {}
                }
            }
            BrokerCommand::ClientVanished(client) => self.client_vanished(client).await,
        }
        None
    }

    #[instrument(level = "debug", skip(self, client), fields(client = %client))]
    async fn request_api(&mut self, name: &str, client: &ClientId) -> Option<EndpointPath> {
        let Ok(kind) = name.parse::<CapabilityKind>() else {
            debug!("unknown capability requested");
            return None;
        };
        let grant = self.registry.request_api(kind, client)?;
        match grant.transition {
            Some(transition) => {
                apply_transition(self.host.as_ref(), &self.events, &mut self.published, transition).await;
            }
            None if !self.published.contains(&kind) => {
                publish(self.host.as_ref(), &mut self.published, kind, &grant.path).await;
            }
            None => {}
        }
        Some(grant.path)
    }

    #[instrument(level = "debug", skip(self, client), fields(client = %client))]
    async fn release_api(&mut self, name: &str, client: &ClientId) {
        let Ok(kind) = name.parse::<CapabilityKind>() else {
            debug!("release of unknown capability ignored");
            return;
        };
        if let Some(transition) = self.registry.release_api(kind, client) {
            apply_transition(self.host.as_ref(), &self.events, &mut self.published, transition).await;
        }
    }

    #[instrument(level = "debug", skip(self, client), fields(client = %client))]
    async fn client_vanished(&mut self, client: ClientId) {
        let transitions = self.reclaimer.reclaim(&mut self.registry, &client);
        for transition in transitions {
            apply_transition(self.host.as_ref(), &self.events, &mut self.published, transition).await;
        }
        self.broadcast(BrokerEvent::ClientVanished(client));
    }

    fn broadcast(&self, payload: BrokerEvent) {
        broadcast(&self.events, payload);
    }

    fn notify(&self, state: NotifyState) {
        notify(self.notifier.as_ref(), &state);
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Run the stop sequence while still answering the command queue.
    async fn teardown(mut self, exit_code: i32) -> i32 {
        info!(exit_code, "broker stopping");
        {
            let stop = stop(
                &mut self.registry,
                self.host.as_ref(),
                self.notifier.as_ref(),
                &self.events,
                &mut self.published,
            );
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    biased;
                    () = &mut stop => break,
                    Some(command) = self.commands.recv() => {
                        refuse_while_stopping(&mut self.shutdown, &self.force_kill, command);
                    }
                }
            }
        }
        self.shutdown.finish();
        info!(exit_code, "broker stopped");
        exit_code
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers shared by the running and stopping phases
// ─────────────────────────────────────────────────────────────────────────────

async fn apply_transition(
    host: &dyn EndpointHost,
    events: &EventBus,
    published: &mut BTreeSet<CapabilityKind>,
    transition: Transition,
) {
    match &transition {
        Transition::Activated { capability, path } => {
            publish(host, published, *capability, path).await;
        }
        Transition::Deactivated { capability, path } => {
            published.remove(capability);
            if let Err(e) = host.unpublish(path).await {
                warn!(capability = %capability, path = %path, error = %e, "failed to unpublish endpoint");
            }
        }
    }
    let event = transition.into_event();
    if let Err(e) = host.emit(&event).await {
        warn!(error = %e, "failed to emit lifecycle signal");
    }
    broadcast(events, event);
}

async fn publish(
    host: &dyn EndpointHost,
    published: &mut BTreeSet<CapabilityKind>,
    capability: CapabilityKind,
    path: &EndpointPath,
) {
    match host.publish(capability, path).await {
        Ok(()) => {
            published.insert(capability);
        }
        Err(e) => {
            warn!(capability = %capability, path = %path, error = %e, "failed to publish endpoint");
        }
    }
}

fn broadcast(events: &EventBus, payload: BrokerEvent) {
    if let Err(e) = events.publish(Event::new(EVENT_SOURCE, payload)) {
        warn!(error = %e, "failed to broadcast broker event");
    }
}

fn notify(notifier: &dyn InitNotifier, state: &NotifyState) {
    if let Err(e) = notifier.notify(state) {
        warn!(state = ?state, error = %e, "init system notification failed");
    }
}

/// The stop sequence proper.  Runs once.
async fn stop(
    registry: &mut Registry,
    host: &dyn EndpointHost,
    notifier: &dyn InitNotifier,
    events: &EventBus,
    published: &mut BTreeSet<CapabilityKind>,
) {
    notify(notifier, &NotifyState::Status("stopping".to_string()));
    notify(notifier, &NotifyState::Stopping);

    if let Err(e) = host.emit(&BrokerEvent::AboutToQuit).await {
        warn!(error = %e, "failed to emit aboutToQuit");
    }
    broadcast(events, BrokerEvent::AboutToQuit);

    for transition in registry.shutdown() {
        apply_transition(host, events, published, transition).await;
    }

    if let Err(e) = host.release_name().await {
        warn!(error = %e, "failed to release bus name");
    }
}

/// Answer a command that arrives after shutdown began.  Leases are no
/// longer granted and every lease is already gone; a second signal forces
/// the kill.
fn refuse_while_stopping(shutdown: &mut ShutdownCoordinator, force_kill: &ForceKill, command: BrokerCommand) {
    match command {
        BrokerCommand::RequestApi { reply, .. } => {
            let _ = reply.send(None);
        }
        BrokerCommand::ReleaseApi { reply, .. } => {
            let _ = reply.send(());
        }
        BrokerCommand::ListActive { reply } => {
            let _ = reply.send(Default::default());
        }
        BrokerCommand::ExitRequest { client, exit_code } => {
            shutdown.request(ShutdownOrigin::Bus { client, exit_code });
        }
        BrokerCommand::Signal(signal) => {
            if shutdown.request(ShutdownOrigin::Signal(signal)) == ShutdownAction::ForceKill {
                force_kill();
            }
        }
        BrokerCommand::ClientVanished(client) => {
            debug!(client = %client, "client vanished while stopping");
        }
    }
}
