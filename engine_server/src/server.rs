//! Authoritative host.
//!
//! `GameHost` wraps an [`RpcPeer`] in host mode. It owns one entity per
//! connected player, queues the `input_state` calls each player sends and
//! applies them once per tick, relays chat, and broadcasts the full entity
//! list with `set_states` after every tick.
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - Iterate players in connection order (`BTreeMap` keyed by id).

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    net::SocketAddr,
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use engine_shared::{
    config::EngineConfig,
    connection::{Connection, ConnectionId},
    math::Vec3,
    peer::Role,
    protocol::{self, EntityState, InputState, MAX_CHAT_LENGTH},
    rpc::{Procedure, RpcPeer, RunsOn},
    shutdown::ShutdownSignal,
};
use tracing::{debug, info, warn};

/// Unprocessed inputs a player may have queued before being dropped.
pub const MAX_PENDING_INPUTS: usize = 100;

/// Distance covered per input at full stick.
const MOVE_SPEED: f64 = 0.1;
const JUMP_HEIGHT: f64 = 1.0;

/// Simulated body of one player.
#[derive(Debug, Clone, PartialEq)]
struct Avatar {
    entity: EntityState,
    last_sequence: i64,
}

impl Avatar {
    fn new(entity: EntityState) -> Self {
        Self {
            entity,
            last_sequence: 0,
        }
    }

    fn apply(&mut self, input: InputState) {
        // Stale or replayed inputs are ignored.
        if input.sequence <= self.last_sequence {
            return;
        }
        self.last_sequence = input.sequence;
        let wish = input.movement.normalized();
        let step = Vec3::new(wish.x, wish.y, 0.0).scale(MOVE_SPEED);
        self.entity.position = self.entity.position.add(step);
        self.entity.position.z = if input.jump { JUMP_HEIGHT } else { 0.0 };
    }
}

struct Player {
    connection: Connection,
    avatar: Avatar,
    pending: VecDeque<InputState>,
}

/// State touched by the RPC handlers.
#[derive(Default)]
struct HostWorld {
    players: BTreeMap<ConnectionId, Player>,
    next_entity: i64,
    process_inputs: bool,
    chat_log: Vec<(String, String)>,
}

impl HostWorld {
    fn spawn(&mut self, connection: &Connection) {
        self.next_entity += 1;
        let id = self.next_entity;
        let avatar = Avatar::new(EntityState::new(id, &format!("player{id}")));
        info!(connection = %connection.id(), entity = id, addr = %connection.remote_addr(), "player joined");
        self.players.insert(
            connection.id(),
            Player {
                connection: connection.clone(),
                avatar,
                pending: VecDeque::new(),
            },
        );
    }

    fn despawn(&mut self, connection: &Connection) {
        if let Some(player) = self.players.remove(&connection.id()) {
            info!(
                connection = %connection.id(),
                entity = player.avatar.entity.id,
                timed_out = connection.is_timed_out(),
                "player left"
            );
        }
    }

    fn queue_input(&mut self, connection: &Connection, input: InputState) {
        let Some(player) = self.players.get_mut(&connection.id()) else {
            return;
        };
        player.pending.push_back(input);
        if player.pending.len() > MAX_PENDING_INPUTS {
            warn!(
                connection = %connection.id(),
                pending = player.pending.len(),
                "input flood, disconnecting"
            );
            connection.disconnect();
        }
    }

    fn apply_inputs(&mut self) {
        for player in self.players.values_mut() {
            while let Some(input) = player.pending.pop_front() {
                player.avatar.apply(input);
            }
        }
    }

    fn states(&self) -> Vec<EntityState> {
        self.players.values().map(|p| p.avatar.entity.clone()).collect()
    }
}

/// Game host.
pub struct GameHost {
    cfg: EngineConfig,
    rpc: RpcPeer,
    world: Rc<RefCell<HostWorld>>,
    set_states: Procedure<(Vec<EntityState>,)>,
    tick: u64,
}

impl GameHost {
    /// Creates a host and registers its procedures. Nothing is bound until
    /// [`GameHost::start`].
    pub fn new(cfg: EngineConfig) -> anyhow::Result<Self> {
        let mut rpc = RpcPeer::new(cfg.net.clone()).context("create host peer")?;
        let world = Rc::new(RefCell::new(HostWorld {
            process_inputs: true,
            ..Default::default()
        }));

        let w = Rc::clone(&world);
        rpc.on_connect(RunsOn::HOST, move |connection, _| w.borrow_mut().spawn(connection))?;
        let w = Rc::clone(&world);
        rpc.on_disconnect(RunsOn::HOST, move |connection, _| w.borrow_mut().despawn(connection))?;

        let w = Rc::clone(&world);
        rpc.register(protocol::INPUT_STATE, RunsOn::HOST, move |connection, _, (input,): (InputState,)| {
            w.borrow_mut().queue_input(connection, input)
        })?;

        let w = Rc::clone(&world);
        let relay = protocol::chat_message();
        rpc.register(
            protocol::CHAT_MESSAGE,
            RunsOn::HOST,
            move |connection, _, (name, text): (String, String)| {
                if text.chars().count() > MAX_CHAT_LENGTH {
                    debug!(connection = %connection.id(), "dropping overlong chat line");
                    return;
                }
                let mut world = w.borrow_mut();
                let payload = match relay.encode(&(name.clone(), text.clone())) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "cannot encode chat relay");
                        return;
                    }
                };
                for player in world.players.values() {
                    player.connection.send(&payload);
                }
                info!(connection = %connection.id(), %name, %text, "chat");
                world.chat_log.push((name, text));
            },
        )?;

        // The client side of this procedure lives in the client; the host
        // only needs the stub to send.
        let set_states = protocol::set_states();

        Ok(Self {
            cfg,
            rpc,
            world,
            set_states,
            tick: 0,
        })
    }

    /// Starts listening on `server_addr`.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let (host, port) = self.cfg.host_port()?;
        self.rpc.start(&host, port, Role::Host)?;
        info!(addr = ?self.local_addr(), tick_hz = self.cfg.tick_hz, "host listening");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.rpc.stop();
        self.world.borrow_mut().players.clear();
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.rpc.peer().local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.rpc.is_running()
    }

    /// Pauses or resumes input consumption. While paused, queued inputs
    /// accumulate toward [`MAX_PENDING_INPUTS`].
    pub fn set_input_processing(&mut self, enabled: bool) {
        self.world.borrow_mut().process_inputs = enabled;
    }

    /// Executes one fixed step: handle network events, apply inputs,
    /// broadcast entity states. Returns the number of events handled.
    pub fn step(&mut self) -> usize {
        let handled = self.rpc.update(self.cfg.net.max_events_per_update);

        let mut world = self.world.borrow_mut();
        if world.process_inputs {
            world.apply_inputs();
        }
        if !world.players.is_empty() {
            match self.set_states.encode(&(world.states(),)) {
                Ok(payload) => broadcast(&world, &payload),
                Err(e) => warn!(error = %e, "cannot encode entity states"),
            }
        }
        self.tick += 1;
        handled
    }

    /// Runs fixed steps at `tick_hz` until `shutdown` is triggered.
    pub fn run(&mut self, shutdown: &ShutdownSignal) {
        let dt = Duration::from_secs_f64(1.0 / f64::from(self.cfg.tick_hz.max(1)));
        let mut next = Instant::now();
        while !shutdown.is_triggered() {
            self.step();
            next += dt;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            } else {
                // Fell behind; don't try to catch up.
                next = now;
            }
        }
        info!(ticks = self.tick, "host shutting down");
        self.stop();
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn player_count(&self) -> usize {
        self.world.borrow().players.len()
    }

    /// Current replicated states, in join order.
    pub fn entity_states(&self) -> Vec<EntityState> {
        self.world.borrow().states()
    }

    /// Inputs queued but not yet applied for `connection`.
    pub fn pending_inputs(&self, connection: &Connection) -> usize {
        self.world
            .borrow()
            .players
            .get(&connection.id())
            .map_or(0, |p| p.pending.len())
    }

    /// Chat lines relayed so far as `(name, text)`.
    pub fn chat_log(&self) -> Vec<(String, String)> {
        self.world.borrow().chat_log.clone()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.rpc.connections()
    }

    pub fn rpc(&self) -> &RpcPeer {
        &self.rpc
    }
}

fn broadcast(world: &HostWorld, payload: &Bytes) {
    for player in world.players.values() {
        player.connection.send(payload);
    }
}

/// Helper for tests: a host on an ephemeral loopback port.
pub fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<GameHost> {
    let cfg = EngineConfig {
        server_addr: "127.0.0.1:0".to_string(),
        tick_hz,
        ..Default::default()
    };
    let mut host = GameHost::new(cfg)?;
    host.start()?;
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::math::Vec2;

    fn input(sequence: i64, x: f64, jump: bool) -> InputState {
        InputState {
            sequence,
            movement: Vec2::new(x, 0.0),
            jump,
        }
    }

    #[test]
    fn inputs_move_the_avatar() {
        let mut avatar = Avatar::new(EntityState::new(1, "p"));
        avatar.apply(input(1, 1.0, false));
        avatar.apply(input(2, 3.0, true));
        assert!((avatar.entity.position.x - 2.0 * MOVE_SPEED).abs() < 1e-9);
        assert_eq!(avatar.entity.position.z, JUMP_HEIGHT);
        assert_eq!(avatar.last_sequence, 2);
    }

    #[test]
    fn stale_inputs_are_ignored() {
        let mut avatar = Avatar::new(EntityState::new(1, "p"));
        avatar.apply(input(5, 1.0, false));
        let moved = avatar.clone();
        avatar.apply(input(5, 1.0, false));
        avatar.apply(input(3, -1.0, true));
        assert_eq!(avatar, moved);
    }

    #[test]
    fn host_starts_on_ephemeral_port() {
        let mut host = bind_ephemeral(64).unwrap();
        assert!(host.is_running());
        assert_ne!(host.local_addr().unwrap().port(), 0);
        assert_eq!(host.step(), 0);
        assert_eq!(host.tick(), 1);
        assert_eq!(host.player_count(), 0);
        host.stop();
        assert!(!host.is_running());
    }

    #[test]
    fn invalid_addr_fails_to_start() {
        let cfg = EngineConfig {
            server_addr: "127.0.0.1".into(),
            ..Default::default()
        };
        assert!(GameHost::new(cfg).unwrap().start().is_err());
    }
}
