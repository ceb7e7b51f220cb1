//! Game protocol shared by host and client.
//!
//! Both sides build their procedure stubs from these declarations, so
//! names and argument types cannot drift apart.

use crate::{
    codec::{CodecError, Datagram, DatagramReader, DatagramWriter, TypeTag},
    math::{Vec2, Vec3, Vec4},
    rpc::Procedure,
};

pub const SET_STATES: &str = "set_states";
pub const INPUT_STATE: &str = "input_state";
pub const CHAT_MESSAGE: &str = "chat_message";

/// Longest chat line the host relays.
pub const MAX_CHAT_LENGTH: usize = 256;

/// Replicated state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub id: i64,
    pub name: String,
    pub position: Vec3,
    pub rotation: Vec4,
    pub alive: bool,
}

impl EntityState {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            position: Vec3::ZERO,
            rotation: Vec4::default(),
            alive: true,
        }
    }
}

impl Datagram for EntityState {
    fn type_tag() -> TypeTag {
        TypeTag::Custom("EntityState")
    }

    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_int(self.id);
        w.put_str(&self.name)?;
        w.write(&self.position)?;
        w.write(&self.rotation)?;
        w.put_bool(self.alive);
        Ok(())
    }

    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            id: r.get_int()?,
            name: r.get_string()?,
            position: r.read()?,
            rotation: r.read()?,
            alive: r.get_bool()?,
        })
    }
}

/// One sampled frame of player input.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputState {
    pub sequence: i64,
    pub movement: Vec2,
    pub jump: bool,
}

impl Datagram for InputState {
    fn type_tag() -> TypeTag {
        TypeTag::Custom("InputState")
    }

    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_int(self.sequence);
        w.write(&self.movement)?;
        w.put_bool(self.jump);
        Ok(())
    }

    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            sequence: r.get_int()?,
            movement: r.read()?,
            jump: r.get_bool()?,
        })
    }
}

/// Host -> client: full entity state list.
pub fn set_states() -> Procedure<(Vec<EntityState>,)> {
    Procedure::new(SET_STATES)
}

/// Client -> host: one input frame.
pub fn input_state() -> Procedure<(InputState,)> {
    Procedure::new(INPUT_STATE)
}

/// Either direction: sender name and text.
pub fn chat_message() -> Procedure<(String, String)> {
    Procedure::new(CHAT_MESSAGE)
}
