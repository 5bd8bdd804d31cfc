//! Flip one wire from the command line: `remctl <wire> <1/0> [uri]`.

use std::env;
use std::process::exit;

use anyhow::Result;
use protobuf::{Enum, EnumFull};

use fabd_protocol::bus::{recv_protobuf, send_protobuf, wire_change};
use fabd_protocol::hvac::Wire;
use fabd_protocol::protos::generated::fabd::{HVACWires, Request, RequestReply};
use fabd_protocol::security::SecurityContext;

const DEFAULT_URI: &str = "ipc://nbp.ipc";

fn wire_by_name(name: &str) -> Option<Wire> {
    let descriptor = HVACWires::enum_descriptor();
    let value = descriptor.value_by_name(name)?;
    HVACWires::from_i32(value.value()).map(Wire::from_pb)
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        eprintln!("Usage: {} <wire> <1/0> [uri]", args[0]);
        exit(1);
    }

    let Some(wire) = wire_by_name(&args[1]) else {
        eprintln!("Unknown wire \"{}\"", args[1]);
        exit(1);
    };
    let connect = match args[2].as_str() {
        "1" => true,
        "0" => false,
        other => {
            eprintln!("Unknown value: \"{}\"", other);
            exit(1);
        }
    };

    let security = SecurityContext::load()?;
    let ctx = zmq::Context::new();
    let ctl = ctx.socket(zmq::REQ)?;
    security.apply_client(&ctl)?;
    ctl.connect(args.get(3).map(String::as_str).unwrap_or(DEFAULT_URI))?;

    let mut request = Request::new();
    request.sethvacwire.push(wire_change(wire, connect));
    send_protobuf(&ctl, &request)?;

    let reply: RequestReply = recv_protobuf(&ctl)?;
    if reply.sethvacwiresuccess.first() != Some(&true) {
        println!("Error changing FET");
        exit(1);
    }
    Ok(())
}
