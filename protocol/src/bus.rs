//! Protobuf messages over the bus, one packed message per socket frame, and
//! the late-join snapshot handshake publishers run on their XPUB sockets.

use anyhow::Result;
use protobuf::{Message, MessageField};

use crate::hvac::{Tristate, Wire};
use crate::protos::generated::fabd::{Event, HVACGoals, SetHVACWireRequest, Weather};

pub fn send_protobuf<M: Message>(socket: &zmq::Socket, msg: &M) -> Result<()> {
    let buf = msg.write_to_bytes()?;
    socket.send(&buf[..], 0)?;
    Ok(())
}

pub fn recv_protobuf<M: Message>(socket: &zmq::Socket) -> Result<M> {
    let raw = socket.recv_bytes(0)?;
    Ok(M::parse_from_bytes(&raw)?)
}

/// Decode an XPUB subscription notification: `Some(true)` is a new
/// subscriber (snapshot time), `Some(false)` an unsubscribe, `None` an
/// empty notification.
pub fn recv_subscription(socket: &zmq::Socket) -> Result<Option<bool>> {
    let raw = socket.recv_bytes(0)?;
    Ok(raw.first().map(|&b| b != 0))
}

pub fn wire_change(wire: Wire, connect: bool) -> SetHVACWireRequest {
    let mut change = SetHVACWireRequest::new();
    change.set_wire(wire.to_pb());
    change.set_connect(connect);
    change
}

/// An Event carrying a single wire change.
pub fn wire_change_event(wire: Wire, connect: bool) -> Event {
    let mut event = Event::new();
    event.wire_change.push(wire_change(wire, connect));
    event
}

/// Snapshot Event for a late joiner: optionally the last weather reading,
/// plus every wire whose tracked state is known.
pub fn snapshot_event<'a, I>(weather: Option<Weather>, wires: I) -> Event
where
    I: IntoIterator<Item = (Wire, Tristate)>,
{
    let mut event = Event::new();
    if let Some(w) = weather {
        event.weather = MessageField::some(w);
    }
    for (wire, value) in wires {
        let connect = match value {
            Tristate::Unknown => continue,
            Tristate::On => true,
            Tristate::Off => false,
        };
        event.wire_change.push(wire_change(wire, connect));
    }
    event
}

pub fn goals_event(goals: HVACGoals) -> Event {
    let mut event = Event::new();
    event.hvacgoals = MessageField::some(goals);
    event
}
