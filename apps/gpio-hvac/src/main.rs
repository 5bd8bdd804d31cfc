use anyhow::{Context, Result};
use log::{info, warn};
use rppal::gpio::{Gpio, OutputPin};

use fabd_protocol::bus::{
    recv_protobuf, recv_subscription, send_protobuf, snapshot_event, wire_change_event,
};
use fabd_protocol::fabdcfg::FabdConfig;
use fabd_protocol::hvac::{
    self, onoff, RelayState, Tristate, Wire, WirePlant, ALL_WIRES, WIRE_SLOTS,
};
use fabd_protocol::protos::generated::fabd::{Request, RequestReply};
use fabd_protocol::security::SecurityContext;
use fabd_protocol::timespec::Stamp;

/// Relay lines this driver can own, with their config keys.
const WIRE_KEYS: [(Wire, &str); 4] = [
    (Wire::Y1, "compressor"),
    (Wire::Ob, "reversing"),
    (Wire::G, "fan"),
    (Wire::W2, "heat 2"),
];

struct GpioPlant {
    pins: [Option<OutputPin>; WIRE_SLOTS],
    states: [RelayState; WIRE_SLOTS],
    publisher: zmq::Socket,
}

impl WirePlant for GpioPlant {
    fn state(&self, wire: Wire) -> &RelayState {
        &self.states[wire.index()]
    }

    fn controllable(&self, wire: Wire) -> bool {
        self.pins[wire.index()].is_some()
    }

    fn apply_unsafe(&mut self, wire: Wire, connect: bool, now: Stamp) -> bool {
        let Some(pin) = self.pins[wire.index()].as_mut() else {
            return false;
        };
        if connect {
            pin.set_high();
        } else {
            pin.set_low();
        }

        let state = &mut self.states[wire.index()];
        if state.value != Tristate::from(connect) {
            info!("Turned {} {}", wire.name(), onoff(connect));
            state.last_change = now;
        }
        state.value = connect.into();

        let _ = send_protobuf(&self.publisher, &wire_change_event(wire, connect));
        true
    }
}

fn handle_req(ctl: &zmq::Socket, plant: &mut GpioPlant, now: Stamp) -> Result<()> {
    let req: Request = recv_protobuf(ctl)?;
    let mut reply = RequestReply::new();
    for entry in &req.sethvacwire {
        let wire = Wire::from_pb(entry.wire());
        reply
            .sethvacwiresuccess
            .push(hvac::set_wire_safe(plant, wire, entry.connect(), now));
    }
    send_protobuf(ctl, &reply)
}

fn send_snapshot(plant: &GpioPlant) -> Result<()> {
    let wires = ALL_WIRES.map(|w| (w, plant.states[w.index()].value));
    send_protobuf(&plant.publisher, &snapshot_event(None, wires))
}

fn main() -> Result<()> {
    env_logger::init();
    let (devid, cfg) = FabdConfig::common_args()?;
    if !cfg.device_is_type(&devid, "gpio_hvac") {
        warn!("device {} is not configured as a gpio_hvac", devid);
    }

    let security = SecurityContext::load()?;
    let ctx = zmq::Context::new();
    security.start_zap_handler(&ctx)?;

    let ctl = ctx.socket(zmq::REP)?;
    security.apply_server(&ctl)?;
    cfg.zmq_bind(&devid, "control", &ctl)
        .context("control server")?;

    let publisher = ctx.socket(zmq::XPUB)?;
    publisher.set_xpub_verbose(true)?;
    security.apply_server(&publisher)?;
    cfg.zmq_bind(&devid, "events", &publisher)
        .context("events server")?;

    let now = Stamp::now();
    let mut plant = GpioPlant {
        pins: std::array::from_fn(|_| None),
        states: [RelayState::new(now); WIRE_SLOTS],
        publisher,
    };

    let gpio = Gpio::new().context("cannot open GPIO")?;
    let gpios = cfg
        .device_get(&devid, "gpios")
        .context("no gpios configured")?
        .clone();
    for (wire, key) in WIRE_KEYS {
        let Some(pin_num) = gpios.get(key).and_then(|v| v.as_u64()) else {
            continue;
        };
        let pin = gpio
            .get(pin_num as u8)
            .with_context(|| format!("cannot claim GPIO {} for {}", pin_num, wire.name()))?
            .into_output_low();
        plant.pins[wire.index()] = Some(pin);
    }

    // Walk everything down to a known state before serving anyone.
    let now = Stamp::now();
    for wire in [Wire::W2, Wire::Y1, Wire::Ob, Wire::G] {
        if plant.controllable(wire) {
            hvac::set_wire_safe(&mut plant, wire, false, now);
        }
    }

    loop {
        let (ctl_ready, join_ready) = {
            let mut items = [
                ctl.as_poll_item(zmq::POLLIN),
                plant.publisher.as_poll_item(zmq::POLLIN),
            ];
            if zmq::poll(&mut items, -1)? <= 0 {
                continue;
            }
            (items[0].is_readable(), items[1].is_readable())
        };

        let now = Stamp::now();
        if ctl_ready {
            handle_req(&ctl, &mut plant, now)?;
        }
        if join_ready {
            if let Some(true) = recv_subscription(&plant.publisher)? {
                send_snapshot(&plant)?;
            }
        }
    }
}
