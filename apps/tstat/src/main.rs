mod control;

use anyhow::{Context, Result};
use chrono::Local;
use log::{info, warn};

use fabd_protocol::bus::{self, goals_event, recv_protobuf, recv_subscription, send_protobuf};
use fabd_protocol::fabdcfg::FabdConfig;
use fabd_protocol::hvac::Wire;
use fabd_protocol::protos::generated::fabd::{Event, Request, RequestReply};
use fabd_protocol::security::SecurityContext;
use fabd_protocol::timespec::{Deadline, Stamp};
use protobuf::MessageField;

use control::{Controller, Goals, WireRequester, DEFAULT_GOAL_HIGH, DEFAULT_HYSTERESIS};

/// Relay-driver client over the synchronous control socket. Every request
/// carries one wire; any transport hiccup reads as a refusal and the
/// controller's timers retry.
struct HwClient {
    socket: zmq::Socket,
}

impl WireRequester for HwClient {
    fn set_wire(&mut self, wire: Wire, connect: bool) -> bool {
        let mut req = Request::new();
        req.sethvacwire.push(bus::wire_change(wire, connect));
        if send_protobuf(&self.socket, &req).is_err() {
            return false;
        }
        match recv_protobuf::<RequestReply>(&self.socket) {
            Ok(reply) => reply.sethvacwiresuccess.first().copied().unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn goals_from_config(cfg: &FabdConfig, devid: &str) -> Goals {
    let low = cfg
        .device_get(devid, "goal_low")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    Goals {
        low,
        high: Some(cfg.device_get_int(devid, "goal_high", DEFAULT_GOAL_HIGH as i64) as i32),
        hysteresis: cfg.device_get_int(devid, "hysteresis", DEFAULT_HYSTERESIS as i64) as i32,
        fan_always_on: cfg.device_get_bool(devid, "fan_always_on", false),
    }
}

fn handle_weather(
    events: &zmq::Socket,
    tstat: &mut Controller,
    hw: &mut HwClient,
    now: Stamp,
) -> Result<()> {
    let event: Event = recv_protobuf(events)?;
    if let Some(weather) = event.weather.as_ref() {
        if weather.has_temperature() {
            tstat.on_temperature(weather.temperature(), now, hw);
        }
    }
    Ok(())
}

fn handle_request(
    ctl: &zmq::Socket,
    publisher: &zmq::Socket,
    tstat: &mut Controller,
    hw: &mut HwClient,
) -> Result<()> {
    let req: Request = recv_protobuf(ctl)?;
    let mut reply = RequestReply::new();

    // Wire control is the relay drivers' job, not ours.
    for _ in &req.sethvacwire {
        reply.sethvacwiresuccess.push(false);
    }

    if let Some(update) = req.hvacgoals.as_ref() {
        if tstat.apply_goals(update, hw) {
            send_protobuf(publisher, &goals_event(tstat.goals().to_pb()))?;
        }
    }

    reply.hvacgoals = MessageField::some(tstat.goals().to_pb());
    send_protobuf(ctl, &reply)
}

fn main() -> Result<()> {
    env_logger::init();
    let (devid, cfg) = FabdConfig::common_args()?;
    if !cfg.device_is_type(&devid, "tstat") {
        warn!("device {} is not configured as a tstat", devid);
    }
    info!("starting at {}", Local::now().format("%a %d %b %Y %H:%M:%S"));

    let security = SecurityContext::load()?;
    let ctx = zmq::Context::new();
    security.start_zap_handler(&ctx)?;

    let hwctl = ctx.socket(zmq::REQ)?;
    security.apply_client(&hwctl)?;
    cfg.zmq_connect(&devid, "hwctl", &hwctl)
        .context("hwctl client")?;
    let mut hw = HwClient { socket: hwctl };

    let weather = ctx.socket(zmq::SUB)?;
    security.apply_client(&weather)?;
    cfg.zmq_connect(&devid, "weather", &weather)
        .context("weather client")?;
    weather.set_subscribe(b"")?;

    let publisher = ctx.socket(zmq::XPUB)?;
    publisher.set_xpub_verbose(true)?;
    security.apply_server(&publisher)?;
    cfg.zmq_bind(&devid, "events", &publisher)
        .context("events server")?;

    let ctl = ctx.socket(zmq::REP)?;
    security.apply_server(&ctl)?;
    cfg.zmq_bind(&devid, "control", &ctl)
        .context("control server")?;

    let mut tstat = Controller::new(goals_from_config(&cfg, &devid), Stamp::now());

    loop {
        let mut deadline = Deadline::unset();
        let now = Stamp::now();
        tstat.run_timers(now, &mut hw, &mut deadline);

        let mut items = [
            weather.as_poll_item(zmq::POLLIN),
            ctl.as_poll_item(zmq::POLLIN),
            publisher.as_poll_item(zmq::POLLIN),
        ];
        if zmq::poll(&mut items, deadline.to_poll_ms(now))? <= 0 {
            continue;
        }

        let now = Stamp::now();
        if items[0].is_readable() {
            handle_weather(&weather, &mut tstat, &mut hw, now)?;
        }
        if items[1].is_readable() {
            handle_request(&ctl, &publisher, &mut tstat, &mut hw)?;
        }
        if items[2].is_readable() {
            // A fresh subscriber gets the current goals as its first event.
            if let Some(true) = recv_subscription(&publisher)? {
                send_protobuf(&publisher, &goals_event(tstat.goals().to_pb()))?;
            }
        }
    }
}
