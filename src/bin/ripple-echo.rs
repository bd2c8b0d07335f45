//! Framed echo server.
//!
//! Usage: `ripple-echo [ADDRESS]`, where ADDRESS is `unix://path` or
//! `tcp://host:port` (default `tcp://127.0.0.1:7070`). Every frame received is sent
//! back unchanged. SIGINT or SIGTERM stops the server.

use ripple::{Connection, NetHooks, NetWorker, ReactorHandle, RuntimeBuilder};

use bytes::Bytes;
use std::process::ExitCode;
use tracing::{error, info, warn};

const DEFAULT_ADDRESS: &str = "tcp://127.0.0.1:7070";

struct Echo;

impl NetHooks for Echo {
    fn on_connect(&mut self, conn: &Connection, _reactor: &ReactorHandle) {
        info!(handle = %conn.id(), peer = %conn.peer().address, "client connected");
    }

    fn on_message(&mut self, conn: &Connection, message: Bytes, reactor: &ReactorHandle) {
        if let Err(error) = conn.send(reactor, &message) {
            warn!(handle = %conn.id(), %error, "echo failed");
            conn.close();
        }
    }

    fn on_close(&mut self, conn: &Connection, _reactor: &ReactorHandle) {
        info!(handle = %conn.id(), "client gone");
    }
}

fn run(address: &str) -> ripple::Result<()> {
    let mut kernel = RuntimeBuilder::from_env()?.build()?;
    kernel.install_signal_handlers()?;

    let mut echo = NetWorker::from_config("echo", Echo, kernel.reactor().config());
    let bound = echo.bind(kernel.reactor(), address)?;
    kernel.push(echo)?;

    info!(address = %bound, "echo server ready");
    kernel.run()
}

fn main() -> ExitCode {
    ripple::logging::init();

    let address = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
    match run(&address) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "echo server failed");
            ExitCode::FAILURE
        }
    }
}
