//! Peer directory and device configuration: a `fabd_cfg/` directory of JSON
//! files, looked up device file first, then the directory's device entry,
//! then the directory defaults.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::Value;

const CFG_DIR: &str = "fabd_cfg";

pub struct FabdConfig {
    directory: Value,
    overrides: HashMap<String, Value>,
}

fn cfg_path(name: &str) -> PathBuf {
    PathBuf::from(CFG_DIR).join(format!("{}.json", name))
}

fn load_json(name: &str) -> Result<Value> {
    let path = cfg_path(name);
    let text =
        fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))
}

/// A string config entry is shorthand for a one-element list.
fn as_list(v: &Value) -> Vec<&Value> {
    match v {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

impl FabdConfig {
    /// Parse the one positional argument every driver takes (its device id)
    /// and load the directory plus that device's override file, if any.
    pub fn common_args() -> Result<(String, FabdConfig)> {
        let args: Vec<String> = env::args().collect();
        if args.len() != 2 {
            bail!("Usage: {} <device-id>", args.first().map(String::as_str).unwrap_or("fabd"));
        }
        let devid = args[1].clone();
        let cfg = FabdConfig::load(&devid)?;
        Ok((devid, cfg))
    }

    pub fn load(devid: &str) -> Result<FabdConfig> {
        let directory = load_json("directory")?;
        let mut overrides = HashMap::new();
        if cfg_path(devid).exists() {
            overrides.insert(devid.to_owned(), load_json(devid)?);
        }
        Ok(FabdConfig {
            directory,
            overrides,
        })
    }

    pub fn from_parts(directory: Value, overrides: HashMap<String, Value>) -> FabdConfig {
        FabdConfig {
            directory,
            overrides,
        }
    }

    pub fn device_get(&self, devid: &str, key: &str) -> Option<&Value> {
        if let Some(v) = self.overrides.get(devid).and_then(|j| j.get(key)) {
            return Some(v);
        }
        if let Some(v) = self
            .directory
            .get("devices")
            .and_then(|d| d.get(devid))
            .and_then(|d| d.get(key))
        {
            return Some(v);
        }
        self.directory.get("defaults").and_then(|d| d.get(key))
    }

    pub fn device_get_str(&self, devid: &str, key: &str) -> Option<&str> {
        self.device_get(devid, key).and_then(Value::as_str)
    }

    pub fn device_get_int(&self, devid: &str, key: &str, def: i64) -> i64 {
        match self.device_get(devid, key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(def),
            Some(Value::String(s)) => s.parse().unwrap_or(def),
            _ => def,
        }
    }

    pub fn device_get_bool(&self, devid: &str, key: &str, def: bool) -> bool {
        match self.device_get(devid, key) {
            None | Some(Value::Null) => def,
            Some(Value::Bool(b)) => *b,
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Some(Value::Object(_)) => true,
        }
    }

    pub fn device_is_type(&self, devid: &str, wanted: &str) -> bool {
        self.device_get_str(devid, "type") == Some(wanted)
    }

    fn server_get(&self, devid: &str, servername: &str) -> Option<&Value> {
        self.device_get(devid, "servers")?.get(servername)
    }

    /// Bind `socket` to every URI in the named server's bind list.
    pub fn zmq_bind(&self, devid: &str, servername: &str, socket: &zmq::Socket) -> Result<()> {
        let mut entry = self
            .server_get(devid, servername)
            .with_context(|| format!("no server {:?} configured for {}", servername, devid))?;
        if entry.is_object() {
            entry = entry
                .get("bind")
                .with_context(|| format!("server {:?} on {} has no bind list", servername, devid))?;
        }
        for uri in as_list(entry) {
            let uri = uri
                .as_str()
                .with_context(|| format!("non-string bind entry for {:?}", servername))?;
            socket
                .bind(uri)
                .with_context(|| format!("cannot bind {} for {:?}", uri, servername))?;
        }
        Ok(())
    }

    /// Connect `socket` per the named client entry, resolving `fabd:` URIs
    /// through the directory.
    pub fn zmq_connect(&self, devid: &str, clientname: &str, socket: &zmq::Socket) -> Result<()> {
        let entries = self
            .device_get(devid, "clients")
            .and_then(|c| c.get(clientname))
            .with_context(|| format!("no client {:?} configured for {}", clientname, devid))?;
        for entry in as_list(entries) {
            let Some(uri) = entry.as_str() else { continue };
            let resolved = match parse_devuri(uri) {
                Some((dest_devid, dest_server)) => self
                    .server_connect_uri(dest_devid, dest_server, devid)
                    .with_context(|| format!("cannot resolve {}", uri))?,
                None => uri.to_owned(),
            };
            socket
                .connect(&resolved)
                .with_context(|| format!("cannot connect {} for {:?}", resolved, clientname))?;
        }
        Ok(())
    }

    /// Best transport for reaching (`devid`, `servername`) from `from_devid`:
    /// an explicit connect list wins; otherwise derive one from the bind list
    /// by substituting `*` with the target's node. `ipc:` only counts when
    /// both devices share a node.
    pub fn server_connect_uri(
        &self,
        devid: &str,
        servername: &str,
        from_devid: &str,
    ) -> Option<String> {
        let node = self.device_get_str(devid, "node");
        let is_local = match (node, self.device_get_str(from_devid, "node")) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };

        let server = self.server_get(devid, servername)?;
        let bind = if server.is_object() {
            if let Some(connect) = server.get("connect") {
                // Choose first applicable URI
                return as_list(connect)
                    .into_iter()
                    .filter_map(Value::as_str)
                    .find(|s| is_local || !s.starts_with("ipc:"))
                    .map(str::to_owned);
            }
            server.get("bind")?
        } else {
            server
        };

        for uri in as_list(bind).into_iter().filter_map(Value::as_str) {
            match uri.find('*') {
                // No wildcard means a node-local endpoint.
                None => {
                    if is_local {
                        return Some(uri.to_owned());
                    }
                }
                Some(pos) => {
                    if let Some(node) = node {
                        return Some(format!("{}{}{}", &uri[..pos], node, &uri[pos + 1..]));
                    }
                }
            }
        }
        None
    }
}

/// `fabd:devid/servername`, slashes after the scheme ignored.
fn parse_devuri(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix("fabd:")?;
    let rest = rest.trim_start_matches('/');
    match rest.split_once('/') {
        Some((devid, server)) => Some((devid, server)),
        None => Some((rest, "")),
    }
}
