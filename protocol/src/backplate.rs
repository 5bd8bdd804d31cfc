//! The backplate serial protocol: a sync-framed, CRC-protected codec and an
//! incremental reader over whatever byte stream carries it.
//!
//! Frame layout: `D5 AA 96 | type u16le | len u16le | payload | crc16 u16le`,
//! CRC over everything between the sync and the CRC itself.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BytesMut};

use crate::crc16::crc16ccitt;
use crate::hvac::{self, RelayState, Tristate, Wire, WirePlant, WIRE_SLOTS};
use crate::timespec::Stamp;

pub const MSG_LOG: u16 = 0x0001;
pub const MSG_WEATHER: u16 = 0x0002;
pub const MSG_FET_PRESENCE: u16 = 0x0004;
pub const MSG_POWER_STATUS: u16 = 0x000b;
pub const MSG_FET_CONTROL: u16 = 0x0082;
pub const MSG_REQ_PERIODIC: u16 = 0x0083;
pub const MSG_FET_PRESENCE_ACK: u16 = 0x008f;
pub const MSG_RESET: u16 = 0x00ff;

pub const POWER_FLAG_NOCHARGE: u8 = 0x40;

const SYNC: [u8; 3] = [0xd5, 0xaa, 0x96];
/// Sync + type + length + CRC; the smallest decodable frame.
const OVERHEAD: usize = 9;
const READ_CHUNK: usize = 0x10;

pub fn encode_frame(mtype: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(OVERHEAD + payload.len());
    buf.extend_from_slice(&SYNC);
    let mut hdr = [0u8; 4];
    LittleEndian::write_u16(&mut hdr[0..2], mtype);
    LittleEndian::write_u16(&mut hdr[2..4], payload.len() as u16);
    buf.extend_from_slice(&hdr);
    buf.extend_from_slice(payload);
    let crc = crc16ccitt(&buf[3..]);
    let mut tail = [0u8; 2];
    LittleEndian::write_u16(&mut tail, crc);
    buf.extend_from_slice(&tail);
    buf
}

#[derive(Debug, Clone, Copy)]
pub struct WeatherReading {
    /// centi-Celsius
    pub temperature: u16,
    /// per-mille
    pub humidity: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct PowerStatus {
    pub state: u8,
    pub flags: u8,
    pub px0: u8,
    // Offsets 3..8 carry fields nobody has identified yet; decoded and
    // passed through so a curious caller can watch them move.
    pub unknown1: u16,
    pub unknown2: u8,
    pub unknown3: u16,
    pub vi_cv: u16,
    pub vo_mv: u16,
    pub vb_mv: u16,
    pub pins: u8,
    pub wires: u8,
}

impl PowerStatus {
    pub fn charging(&self) -> bool {
        self.flags & POWER_FLAG_NOCHARGE == 0
    }
}

/// Receiver for decoded messages and wire assertions. Default impls ignore
/// everything so callers only hook what they care about.
pub trait BackplateSink {
    fn on_log(&mut self, _now: Stamp, _msg: &str) {}
    fn on_weather(&mut self, _now: Stamp, _reading: WeatherReading) {}
    fn on_fet_presence(&mut self, _now: Stamp, _present_mask: u16) {}
    fn on_power_status(&mut self, _now: Stamp, _status: &PowerStatus) {}
    /// Fired for every FET control asserted on the wire, safe or not.
    fn wire_asserted(&mut self, _wire: Wire, _connect: bool) {}
}

/// One open backplate connection: the port, the partial-frame buffer, and
/// the tracked FET bank.
pub struct BackplateDevice<P> {
    port: P,
    rdbuf: BytesMut,
    fets: [RelayState; WIRE_SLOTS],
    weather: Option<WeatherReading>,
    power: Option<PowerStatus>,
}

impl<P: Read + Write> BackplateDevice<P> {
    pub fn new(port: P, now: Stamp) -> BackplateDevice<P> {
        BackplateDevice {
            port,
            rdbuf: BytesMut::new(),
            fets: [RelayState::new(now); WIRE_SLOTS],
            weather: None,
            power: None,
        }
    }

    pub fn last_weather(&self) -> Option<WeatherReading> {
        self.weather
    }

    pub fn last_power(&self) -> Option<PowerStatus> {
        self.power
    }

    pub fn fet_asserted(&self, wire: Wire) -> Tristate {
        self.fets[wire.index()].value
    }

    pub fn fet_present(&self, wire: Wire) -> Tristate {
        self.fets[wire.index()].present
    }

    /// Build and write a frame in a single call. A short write is a failure;
    /// the caller retries at its own cadence.
    pub fn send(&mut self, mtype: u16, payload: &[u8]) -> bool {
        let frame = encode_frame(mtype, payload);
        match self.port.write(&frame) {
            Ok(n) => n == frame.len(),
            Err(_) => false,
        }
    }

    /// Assert a FET with no interlocks. Records the new state; an Off
    /// transition stamps the shutoff time the cycle lockout counts from.
    pub fn control_fet_unsafe(
        &mut self,
        wire: Wire,
        connect: bool,
        now: Stamp,
        sink: &mut dyn BackplateSink,
    ) -> bool {
        if !self.send(MSG_FET_CONTROL, &[wire.index() as u8, connect as u8]) {
            return false;
        }
        let fet = &mut self.fets[wire.index()];
        if fet.value != Tristate::Off && !connect {
            fet.last_change = now;
        }
        fet.value = connect.into();
        sink.wire_asserted(wire, connect);
        true
    }

    /// Assert a FET through the shared interlocks.
    pub fn control_fet(
        &mut self,
        wire: Wire,
        connect: bool,
        now: Stamp,
        sink: &mut dyn BackplateSink,
    ) -> bool {
        let mut plant = DevicePlant { dev: self, sink };
        hvac::set_wire_safe(&mut plant, wire, connect, now)
    }

    /// Pull one chunk off the port and decode every complete frame in the
    /// buffer. Returns false when the port has nothing more to give (EOF or
    /// error); the caller decides whether that is fatal.
    pub fn read(&mut self, now: Stamp, sink: &mut dyn BackplateSink) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        let n = match self.port.read(&mut chunk) {
            Ok(0) | Err(_) => return false,
            Ok(n) => n,
        };
        self.rdbuf.extend_from_slice(&chunk[..n]);

        while self.rdbuf.len() >= OVERHEAD {
            if self.rdbuf[0..3] != SYNC {
                if !self.resync() {
                    break;
                }
                continue;
            }
            let datasz = LittleEndian::read_u16(&self.rdbuf[5..7]) as usize;
            if self.rdbuf.len() < OVERHEAD + datasz {
                // Need more data to proceed
                break;
            }
            let good_crc = crc16ccitt(&self.rdbuf[3..7 + datasz]);
            let actual_crc = LittleEndian::read_u16(&self.rdbuf[7 + datasz..9 + datasz]);
            if good_crc != actual_crc {
                if !self.resync() {
                    break;
                }
                continue;
            }
            let mtype = LittleEndian::read_u16(&self.rdbuf[3..5]);
            let payload = self.rdbuf[7..7 + datasz].to_vec();
            self.rdbuf.advance(OVERHEAD + datasz);
            self.dispatch(mtype, &payload, now, sink);
        }
        true
    }

    /// Skip to the next possible frame start after the current position.
    /// False empties the buffer: no candidate remained.
    fn resync(&mut self) -> bool {
        match self.rdbuf[1..].iter().position(|&b| b == SYNC[0]) {
            Some(pos) => {
                self.rdbuf.advance(pos + 1);
                true
            }
            None => {
                self.rdbuf.clear();
                false
            }
        }
    }

    fn dispatch(&mut self, mtype: u16, payload: &[u8], now: Stamp, sink: &mut dyn BackplateSink) {
        match mtype {
            MSG_LOG => {
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                sink.on_log(now, &String::from_utf8_lossy(&payload[..end]));
            }
            MSG_WEATHER => {
                if payload.len() >= 4 {
                    let reading = WeatherReading {
                        temperature: LittleEndian::read_u16(&payload[0..2]),
                        humidity: LittleEndian::read_u16(&payload[2..4]),
                    };
                    self.weather = Some(reading);
                    sink.on_weather(now, reading);
                }
            }
            MSG_FET_PRESENCE => {
                let mut mask = 0u16;
                for (i, &b) in payload.iter().enumerate() {
                    if i < WIRE_SLOTS {
                        let fet = self.fets[i];
                        if fet.present != Tristate::Off && fet.value != Tristate::Off {
                            // The backplate may have rebooted out from under
                            // us; assert disconnection before trusting it.
                            if let Some(wire) = Wire::from_index(i) {
                                self.control_fet_unsafe(wire, false, now, sink);
                            }
                        }
                        self.fets[i].present = Tristate::from_byte(b);
                    }
                    if b != 0 && i < 16 {
                        mask |= 1 << i;
                    }
                }
                self.send(MSG_FET_PRESENCE_ACK, payload);
                sink.on_fet_presence(now, mask);
            }
            MSG_POWER_STATUS => {
                if payload.len() >= 0x10 {
                    let status = PowerStatus {
                        state: payload[0],
                        flags: payload[1],
                        px0: payload[2],
                        unknown1: LittleEndian::read_u16(&payload[3..5]),
                        unknown2: payload[5],
                        unknown3: LittleEndian::read_u16(&payload[6..8]),
                        vi_cv: LittleEndian::read_u16(&payload[8..0xa]),
                        vo_mv: LittleEndian::read_u16(&payload[0xa..0xc]),
                        vb_mv: LittleEndian::read_u16(&payload[0xc..0xe]),
                        pins: payload[0xe],
                        wires: payload[0xf],
                    };
                    self.power = Some(status);
                    sink.on_power_status(now, &status);
                }
            }
            // Unknown types are dropped; resync already validated the frame.
            _ => {}
        }
    }
}

/// Adapter giving the shared interlocks a view of the FET bank plus the
/// event sink the unsafe path notifies.
struct DevicePlant<'a, P> {
    dev: &'a mut BackplateDevice<P>,
    sink: &'a mut dyn BackplateSink,
}

impl<P: Read + Write> WirePlant for DevicePlant<'_, P> {
    fn state(&self, wire: Wire) -> &RelayState {
        &self.dev.fets[wire.index()]
    }

    fn controllable(&self, wire: Wire) -> bool {
        self.dev.fets[wire.index()].present != Tristate::Off
    }

    fn apply_unsafe(&mut self, wire: Wire, connect: bool, now: Stamp) -> bool {
        self.dev.control_fet_unsafe(wire, connect, now, self.sink)
    }
}
