//! The single-key CURVE trust model: every process loads the shared
//! `secretkey`, servers present it, and the ZAP thread admits only clients
//! whose public key matches it.

use std::fs;
use std::path::Path;
use std::thread;

use anyhow::{bail, Context, Result};
use log::warn;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

const KEY_LEN: usize = 32;
const Z85_KEY_LEN: usize = 40;
const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";
const ZAP_VERSION: &[u8] = b"1.0";

/// Keys for one process. Constructed once at startup and passed into every
/// socket setup; there is no runtime rotation.
pub struct SecurityContext {
    secret: Box<[u8; KEY_LEN]>,
    public: [u8; KEY_LEN],
}

impl SecurityContext {
    pub fn load() -> Result<SecurityContext> {
        Self::load_from(Path::new("secretkey"))
    }

    pub fn load_from(path: &Path) -> Result<SecurityContext> {
        let mut raw = fs::read(path)
            .with_context(|| format!("cannot read secret key {}", path.display()))?;

        let mut secret = Box::new([0u8; KEY_LEN]);
        // Pin the page holding the key before any byte of it lands there.
        unsafe {
            libc::mlock(secret.as_ptr().cast(), KEY_LEN);
        }

        if raw.len() == KEY_LEN {
            secret.copy_from_slice(&raw);
        } else {
            while raw.last().is_some_and(|b| b.is_ascii_whitespace()) {
                raw.pop();
            }
            if raw.len() != Z85_KEY_LEN {
                raw.zeroize();
                bail!(
                    "secret key must be {} raw or {} Z85 bytes",
                    KEY_LEN,
                    Z85_KEY_LEN
                );
            }
            let text = std::str::from_utf8(&raw).context("Z85 key is not ASCII")?;
            let mut decoded =
                zmq::z85_decode(text).map_err(|e| anyhow::anyhow!("invalid Z85 key: {:?}", e))?;
            secret.copy_from_slice(&decoded);
            decoded.zeroize();
        }
        raw.zeroize();

        let public = PublicKey::from(&StaticSecret::from(*secret)).to_bytes();
        Ok(SecurityContext { secret, public })
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    /// CURVE server role: own the secret, accept authenticated clients.
    pub fn apply_server(&self, socket: &zmq::Socket) -> Result<()> {
        socket.set_curve_server(true)?;
        socket.set_curve_secretkey(&self.secret[..])?;
        Ok(())
    }

    /// CURVE client role. The shared key doubles as our identity and the
    /// expected server key.
    pub fn apply_client(&self, socket: &zmq::Socket) -> Result<()> {
        socket.set_curve_serverkey(&self.public)?;
        socket.set_curve_publickey(&self.public)?;
        socket.set_curve_secretkey(&self.secret[..])?;
        Ok(())
    }

    /// Bind the ZAP replier and run it on its own thread. Must happen before
    /// any CURVE socket accepts connections in this context.
    pub fn start_zap_handler(&self, ctx: &zmq::Context) -> Result<thread::JoinHandle<()>> {
        let handler = ctx.socket(zmq::REP)?;
        handler
            .bind(ZAP_ENDPOINT)
            .context("cannot bind ZAP endpoint")?;
        let authority = self.public;
        Ok(thread::spawn(move || zap_loop(&handler, &authority)))
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        self.secret.zeroize();
        unsafe {
            libc::munlock(self.secret.as_ptr().cast(), KEY_LEN);
        }
    }
}

/// Frames per the ZAP request: version, request id, domain, address,
/// identity, mechanism, credential frames. The reply echoes version and
/// request id and answers 200 or 400.
fn zap_loop(handler: &zmq::Socket, authority: &[u8; KEY_LEN]) {
    loop {
        let frames = match handler.recv_multipart(0) {
            Ok(frames) => frames,
            Err(_) => return,
        };
        if frames.len() < 6 {
            warn!("malformed ZAP request with {} frames", frames.len());
            continue;
        }

        let mut problem = frames[0] != ZAP_VERSION;
        if frames[5] != b"CURVE" {
            problem = true;
        }
        match frames.get(6) {
            Some(key) if key.len() >= KEY_LEN => {
                if !problem && key[..KEY_LEN] != authority[..] {
                    problem = true;
                }
            }
            _ => problem = true,
        }

        let status: &[u8] = if problem { b"400" } else { b"200" };
        let reply: Vec<&[u8]> = vec![ZAP_VERSION, &frames[1], status, b"", b"", b""];
        if handler.send_multipart(reply, 0).is_err() {
            return;
        }
    }
}
