use std::os::unix::io::AsRawFd;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use protobuf::MessageField;
use serialport::TTYPort;

use fabd_protocol::backplate::{
    BackplateDevice, BackplateSink, PowerStatus, WeatherReading, MSG_REQ_PERIODIC, MSG_RESET,
};
use fabd_protocol::bus::{
    recv_protobuf, recv_subscription, send_protobuf, snapshot_event, wire_change_event,
};
use fabd_protocol::fabdcfg::FabdConfig;
use fabd_protocol::hvac::{Wire, ALL_WIRES};
use fabd_protocol::protos::generated::fabd::{
    BatteryStatus, Event, Request, RequestReply, Weather,
};
use fabd_protocol::security::SecurityContext;
use fabd_protocol::timespec::{Deadline, Stamp, Timer};

const PERIODIC_REQ_INTERVAL_MS: u64 = 30_000;
const DEFAULT_TTY: &str = "/dev/ttyO2";
const BAUD: u32 = 115_200;

/// Publishes everything the backplate tells us. Wire events flow even while
/// the publisher is unbound (pre-reset); they fan out to nobody.
struct BusSink {
    publisher: zmq::Socket,
    reset_confirmed: bool,
}

impl BackplateSink for BusSink {
    fn on_log(&mut self, _now: Stamp, msg: &str) {
        info!("Backplate: {}", msg);
    }

    fn on_weather(&mut self, _now: Stamp, reading: WeatherReading) {
        let t = reading.temperature as i32;
        let fahrenheit = t * 90 / 5 + 32_000;
        info!(
            "Temperature {:3}.{:02} C ({:4}.{:03} F)    Humidity: {}.{}%",
            t / 100,
            t % 100,
            fahrenheit / 1000,
            fahrenheit % 1000,
            reading.humidity / 10,
            reading.humidity % 10
        );

        let mut event = Event::new();
        event.weather = MessageField::some(weather_pb(reading));
        let _ = send_protobuf(&self.publisher, &event);
    }

    fn on_fet_presence(&mut self, _now: Stamp, _mask: u16) {
        self.reset_confirmed = true;
    }

    fn on_power_status(&mut self, _now: Stamp, status: &PowerStatus) {
        let mut battery = BatteryStatus::new();
        battery.set_vi_cv(status.vi_cv as u32);
        battery.set_vo_mv(status.vo_mv as u32);
        battery.set_vb_mv(status.vb_mv as u32);
        battery.set_charging(status.charging());
        let mut event = Event::new();
        event.battery = MessageField::some(battery);
        let _ = send_protobuf(&self.publisher, &event);
    }

    fn wire_asserted(&mut self, wire: Wire, connect: bool) {
        let _ = send_protobuf(&self.publisher, &wire_change_event(wire, connect));
    }
}

fn weather_pb(reading: WeatherReading) -> Weather {
    let mut weather = Weather::new();
    weather.set_temperature(reading.temperature as i32);
    weather.set_humidity(reading.humidity as u32);
    weather
}

fn handle_req(
    ctl: &zmq::Socket,
    dev: &mut BackplateDevice<TTYPort>,
    sink: &mut BusSink,
    now: Stamp,
) -> Result<()> {
    let req: Request = recv_protobuf(ctl)?;
    let mut reply = RequestReply::new();
    for entry in &req.sethvacwire {
        let wire = Wire::from_pb(entry.wire());
        reply
            .sethvacwiresuccess
            .push(dev.control_fet(wire, entry.connect(), now, sink));
    }
    send_protobuf(ctl, &reply)
}

fn send_snapshot(dev: &BackplateDevice<TTYPort>, publisher: &zmq::Socket) -> Result<()> {
    let weather = dev.last_weather().map(weather_pb);
    let wires = ALL_WIRES.map(|w| (w, dev.fet_asserted(w)));
    send_protobuf(publisher, &snapshot_event(weather, wires))
}

fn main() -> Result<()> {
    env_logger::init();
    let (devid, cfg) = FabdConfig::common_args()?;
    if !cfg.device_is_type(&devid, "nbp") {
        warn!("device {} is not configured as a backplate", devid);
    }

    let security = SecurityContext::load()?;
    let ctx = zmq::Context::new();
    security.start_zap_handler(&ctx)?;

    let tty_path = cfg
        .device_get_str(&devid, "tty_device")
        .unwrap_or(DEFAULT_TTY)
        .to_owned();
    let port = serialport::new(&tty_path, BAUD)
        .timeout(Duration::from_millis(100))
        .open_native()
        .with_context(|| format!("cannot open {}", tty_path))?;
    let serial_fd = port.as_raw_fd();
    let mut dev = BackplateDevice::new(port, Stamp::now());

    let ctl = ctx.socket(zmq::REP)?;
    security.apply_server(&ctl)?;
    cfg.zmq_bind(&devid, "control", &ctl)
        .context("control server")?;

    let publisher = ctx.socket(zmq::XPUB)?;
    publisher.set_xpub_verbose(true)?;
    security.apply_server(&publisher)?;
    // NOTE: Not binding until we confirm reset

    let mut sink = BusSink {
        publisher,
        reset_confirmed: false,
    };
    let mut publisher_bound = false;
    let mut next_periodic = Timer::unset();

    if !dev.send(MSG_RESET, &[]) {
        bail!("cannot reset backplate on {}", tty_path);
    }

    loop {
        let mut deadline = Deadline::unset();
        let now = Stamp::now();
        if next_periodic.passed(now, &mut deadline) {
            next_periodic.set(now.add_ms(PERIODIC_REQ_INTERVAL_MS));
            if !dev.send(MSG_REQ_PERIODIC, &[]) {
                warn!("periodic data request failed");
            }
        }

        let (serial_ready, ctl_ready, join_ready) = {
            let mut items = [
                zmq::PollItem::from_fd(serial_fd, zmq::POLLIN),
                ctl.as_poll_item(zmq::POLLIN),
                sink.publisher.as_poll_item(zmq::POLLIN),
            ];
            if zmq::poll(&mut items, deadline.to_poll_ms(now))? <= 0 {
                continue;
            }
            (
                items[0].is_readable(),
                items[1].is_readable(),
                items[2].is_readable(),
            )
        };

        let now = Stamp::now();
        if serial_ready {
            dev.read(now, &mut sink);
            if sink.reset_confirmed && !publisher_bound {
                info!("Backplate reset complete");
                cfg.zmq_bind(&devid, "events", &sink.publisher)
                    .context("events server")?;
                publisher_bound = true;
                next_periodic.set(now);
            }
        }
        if ctl_ready {
            handle_req(&ctl, &mut dev, &mut sink, now)?;
        }
        if join_ready {
            if let Some(true) = recv_subscription(&sink.publisher)? {
                send_snapshot(&dev, &sink.publisher)?;
            }
        }
    }
}
