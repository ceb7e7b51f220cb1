//! Client implementation.
//!
//! The client maintains:
//! - One RPC connection to the host
//! - Snapshot history for interpolation, fed by `set_states`
//! - Per-tick sequenced input sent as `input_state`
//! - Received chat lines

use std::{cell::RefCell, rc::Rc, time::Instant};

use anyhow::Context;
use engine_shared::{
    config::EngineConfig,
    connection::Connection,
    peer::Role,
    protocol::{self, EntityState, InputState},
    rpc::{Procedure, RpcPeer, RunsOn},
};
use tracing::{debug, info, warn};

use crate::{
    input::{build_input, InputSample},
    interp::{Snapshot, SnapshotBuffer},
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected to any server.
    Disconnected,
    /// Connect in progress.
    Connecting,
    /// Connected; states flow.
    Connected,
}

/// State touched by the RPC handlers.
struct ClientView {
    server: Option<Connection>,
    /// Set once the server connection closed; a peer in client mode keeps
    /// running until stopped.
    lost: bool,
    snaps: SnapshotBuffer,
    state_updates: usize,
    messages: Vec<(String, String)>,
}

/// High-level game client.
pub struct GameClient {
    cfg: EngineConfig,
    rpc: RpcPeer,
    view: Rc<RefCell<ClientView>>,
    input_state: Procedure<(InputState,)>,
    chat_message: Procedure<(String, String)>,
    sequence: i64,
}

impl GameClient {
    /// Creates a client and registers its procedures.
    pub fn new(cfg: EngineConfig) -> anyhow::Result<Self> {
        let mut rpc = RpcPeer::new(cfg.net.clone()).context("create client peer")?;
        let view = Rc::new(RefCell::new(ClientView {
            server: None,
            lost: false,
            snaps: SnapshotBuffer::new(32),
            state_updates: 0,
            messages: Vec::new(),
        }));

        let v = Rc::clone(&view);
        rpc.on_connect(RunsOn::CLIENT, move |connection, _| {
            info!(server = %connection.remote_addr(), "Connected to server");
            v.borrow_mut().server = Some(connection.clone());
        })?;
        let v = Rc::clone(&view);
        rpc.on_disconnect(RunsOn::CLIENT, move |connection, _| {
            info!(server = %connection.remote_addr(), timed_out = connection.is_timed_out(), "Disconnected from server");
            let mut view = v.borrow_mut();
            view.server = None;
            view.lost = true;
            view.snaps.clear();
        })?;

        let v = Rc::clone(&view);
        rpc.register(
            protocol::SET_STATES,
            RunsOn::CLIENT,
            move |_, received: Instant, (entities,): (Vec<EntityState>,)| {
                let mut view = v.borrow_mut();
                debug!(entities = entities.len(), "states received");
                view.snaps.push(Snapshot { received, entities });
                view.state_updates += 1;
            },
        )?;

        let v = Rc::clone(&view);
        rpc.register(
            protocol::CHAT_MESSAGE,
            RunsOn::CLIENT,
            move |_, _, (name, text): (String, String)| {
                info!(%name, %text, "chat");
                v.borrow_mut().messages.push((name, text));
            },
        )?;

        Ok(Self {
            cfg,
            rpc,
            view,
            input_state: protocol::input_state(),
            chat_message: protocol::chat_message(),
            sequence: 0,
        })
    }

    /// Starts connecting to `server_addr`. Completion shows up as
    /// [`ClientState::Connected`] after a later [`GameClient::update`].
    pub fn connect(&mut self) -> anyhow::Result<()> {
        let (host, port) = self.cfg.host_port()?;
        info!(server = %self.cfg.server_addr, name = %self.cfg.player_name, "Connecting to server");
        self.view.borrow_mut().lost = false;
        self.rpc.start(&host, port, Role::Client)
    }

    pub fn state(&self) -> ClientState {
        let view = self.view.borrow();
        if view.server.is_some() {
            ClientState::Connected
        } else if self.rpc.is_running() && !view.lost {
            ClientState::Connecting
        } else {
            ClientState::Disconnected
        }
    }

    /// Handles queued network events. Returns the number handled.
    pub fn update(&mut self) -> usize {
        self.rpc.update(self.cfg.net.max_events_per_update)
    }

    /// Advances one client tick: handle events, then send sampled input.
    pub fn tick(&mut self, sample: InputSample) -> anyhow::Result<Option<InputState>> {
        self.update();
        let Some(server) = self.server() else {
            return Ok(None);
        };
        self.sequence += 1;
        let input = build_input(self.sequence, sample);
        self.input_state.call(&server, (input,))?;
        Ok(Some(input))
    }

    /// Sends a chat line as `player_name`.
    pub fn say(&self, text: &str) -> anyhow::Result<()> {
        let Some(server) = self.server() else {
            warn!("not connected, chat dropped");
            return Ok(());
        };
        self.chat_message
            .call(&server, (self.cfg.player_name.clone(), text.to_string()))?;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.rpc.stop();
        let mut view = self.view.borrow_mut();
        view.server = None;
        view.snaps.clear();
    }

    /// Connection to the host, if established.
    pub fn server(&self) -> Option<Connection> {
        self.view.borrow().server.clone()
    }

    /// Most recent entity states received.
    pub fn states(&self) -> Vec<EntityState> {
        self.view
            .borrow()
            .snaps
            .last_snapshot()
            .map(|s| s.entities.clone())
            .unwrap_or_default()
    }

    /// Number of `set_states` calls handled so far.
    pub fn state_updates(&self) -> usize {
        self.view.borrow().state_updates
    }

    /// Interpolated position of `entity` between the last two snapshots.
    pub fn interp_entity(&self, entity: i64, alpha: f64) -> Option<engine_shared::math::Vec3> {
        self.view.borrow().snaps.interp_entity(entity, alpha)
    }

    /// Chat lines received as `(name, text)`.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.view.borrow().messages.clone()
    }

    /// Last input sequence number sent.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn rpc(&self) -> &RpcPeer {
        &self.rpc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_is_disconnected() {
        let mut client = GameClient::new(EngineConfig::default()).unwrap();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.tick(InputSample::default()).unwrap(), None);
        assert_eq!(client.sequence(), 0);
        assert!(client.say("hello").is_ok());
        assert!(client.states().is_empty());
    }

    #[test]
    fn client_registers_its_procedures() {
        let client = GameClient::new(EngineConfig::default()).unwrap();
        let names: Vec<_> = client.rpc().procedures().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec![protocol::CHAT_MESSAGE, protocol::SET_STATES]);
    }
}
