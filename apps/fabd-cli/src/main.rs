//! Generic diagnostic: JSON in, Request out, RequestReply back, JSON printed.

use std::env;
use std::process::exit;

use anyhow::Result;
use protobuf_json_mapping::PrintOptions;

use fabd_protocol::bus::{recv_protobuf, send_protobuf};
use fabd_protocol::protos::generated::fabd::{Request, RequestReply};
use fabd_protocol::security::SecurityContext;

fn print_reply_json(reply: &RequestReply) -> Result<()> {
    let options = PrintOptions {
        proto_field_name: true,
        ..Default::default()
    };
    let compact = protobuf_json_mapping::print_to_string_with_options(reply, &options)?;
    // Re-indent for human eyes.
    let value: serde_json::Value = serde_json::from_str(&compact)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: {} <uri> '<json>'", args[0]);
        exit(1);
    }

    // Unknown fields and out-of-range numbers are conversion errors, not
    // something to silently drop.
    let request: Request = match protobuf_json_mapping::parse_from_str(&args[2]) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("Error converting JSON to Request: {}", err);
            exit(1);
        }
    };

    let security = SecurityContext::load()?;
    let ctx = zmq::Context::new();
    let ctl = ctx.socket(zmq::REQ)?;
    security.apply_client(&ctl)?;
    ctl.connect(&args[1])?;

    send_protobuf(&ctl, &request)?;
    let reply: RequestReply = recv_protobuf(&ctl)?;
    print_reply_json(&reply)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use fabd_protocol::protos::generated::fabd::{HVACWires, Request};
    use protobuf_json_mapping::{parse_from_str, print_to_string_with_options, PrintOptions};

    #[test]
    fn json_to_request_by_field_name() {
        let req: Request = parse_from_str(
            r#"{"sethvacwire": [{"wire": "G", "connect": true}],
                "hvacgoals": {"temp_high": 3020}}"#,
        )
        .unwrap();
        assert_eq!(req.sethvacwire.len(), 1);
        assert_eq!(req.sethvacwire[0].wire(), HVACWires::G);
        assert!(req.sethvacwire[0].connect());
        assert_eq!(req.hvacgoals.temp_high(), 3020);
        assert!(!req.hvacgoals.has_temp_low());
    }

    #[test]
    fn unknown_fields_are_errors() {
        assert!(parse_from_str::<Request>(r#"{"no_such_field": 1}"#).is_err());
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let json = r#"{"sethvacwire": [{"wire": "Y1", "connect": false}], "hvacgoals": {"temp_low": 2400, "temp_high": 3020, "temp_hysteresis": 50}}"#;
        let req: Request = parse_from_str(json).unwrap();
        let options = PrintOptions {
            proto_field_name: true,
            ..Default::default()
        };
        let out = print_to_string_with_options(&req, &options).unwrap();
        let back: Request = parse_from_str(&out).unwrap();
        assert_eq!(req, back);
    }
}
