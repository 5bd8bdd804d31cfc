//! Weather driver over Linux sysfs sensors: millidegree temperature and
//! milli-percent humidity files, published on the usual cadence.

use std::fs;

use anyhow::{Context, Result};
use log::{info, warn};
use protobuf::MessageField;

use fabd_protocol::bus::{recv_subscription, send_protobuf};
use fabd_protocol::fabdcfg::FabdConfig;
use fabd_protocol::protos::generated::fabd::{Event, Weather};
use fabd_protocol::security::SecurityContext;
use fabd_protocol::timespec::{Deadline, Stamp, Timer};

const DEFAULT_POLL_INTERVAL_MS: i64 = 21_094;

struct Sensor {
    temperature_path: String,
    humidity_path: Option<String>,
}

fn read_milli(path: &str) -> Option<i64> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

impl Sensor {
    /// One reading, converted to the bus units: centi-Celsius and per-mille.
    fn sample(&self) -> Option<Weather> {
        let mut weather = Weather::new();
        let t_milli = read_milli(&self.temperature_path)?;
        weather.set_temperature((t_milli / 10) as i32);
        if let Some(path) = &self.humidity_path {
            if let Some(h_milli) = read_milli(path) {
                weather.set_humidity((h_milli / 100).max(0) as u32);
            }
        }
        Some(weather)
    }
}

fn log_reading(weather: &Weather) {
    let t = weather.temperature();
    let fahrenheit = t * 90 / 5 + 32_000;
    if weather.has_humidity() {
        info!(
            "Temperature {:3}.{:02} C ({:4}.{:03} F)  Humidity: {}.{}%",
            t / 100,
            (t % 100).abs(),
            fahrenheit / 1000,
            fahrenheit % 1000,
            weather.humidity() / 10,
            weather.humidity() % 10
        );
    } else {
        info!("Temperature {:3}.{:02} C", t / 100, (t % 100).abs());
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let (devid, cfg) = FabdConfig::common_args()?;
    if !cfg.device_is_type(&devid, "weather") {
        warn!("device {} is not configured as a weather sensor", devid);
    }

    let sensor = Sensor {
        temperature_path: cfg
            .device_get_str(&devid, "temperature_input")
            .context("no temperature_input configured")?
            .to_owned(),
        humidity_path: cfg
            .device_get_str(&devid, "humidity_input")
            .map(str::to_owned),
    };
    let poll_interval_ms =
        cfg.device_get_int(&devid, "poll_interval", DEFAULT_POLL_INTERVAL_MS) as u64;

    let security = SecurityContext::load()?;
    let ctx = zmq::Context::new();
    security.start_zap_handler(&ctx)?;

    let publisher = ctx.socket(zmq::XPUB)?;
    publisher.set_xpub_verbose(true)?;
    security.apply_server(&publisher)?;
    cfg.zmq_bind(&devid, "events", &publisher)
        .context("events server")?;

    let mut current: Option<Event> = None;
    let mut next_poll = Timer::unset();
    next_poll.set(Stamp::now());

    loop {
        let mut deadline = Deadline::unset();
        let now = Stamp::now();
        if next_poll.passed(now, &mut deadline) {
            next_poll.set(now.add_ms(poll_interval_ms));
            match sensor.sample() {
                Some(weather) => {
                    log_reading(&weather);
                    let mut event = Event::new();
                    event.weather = MessageField::some(weather);
                    send_protobuf(&publisher, &event)?;
                    current = Some(event);
                }
                None => warn!("sensor read failed"),
            }
        }

        let mut items = [publisher.as_poll_item(zmq::POLLIN)];
        if zmq::poll(&mut items, deadline.to_poll_ms(now))? <= 0 {
            continue;
        }
        if items[0].is_readable() {
            // Late joiner: repeat the last reading.
            if let Some(true) = recv_subscription(&publisher)? {
                if let Some(event) = &current {
                    send_protobuf(&publisher, event)?;
                }
            }
        }
    }
}
