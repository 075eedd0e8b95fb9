// Demo broker node: one TCP broker, one echo service with a ticking event.
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use courier_broker::{Broker, LocalDirectory, Session};
use courier_object::{LocalObject, ServiceObject};
use courier_pool::WorkerPool;
use courier_transport::tcp::TcpServer;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::NodeConfig;

const METHOD_ECHO: u32 = 1;
const EVENT_TICK: u32 = 2;

fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = NodeConfig::from_env()?;
    let server = TcpServer::new();
    let broker = Broker::new(server);
    let directory = Arc::new(LocalDirectory::new());
    if !broker.listen(Session::new(directory), &config.listen) {
        bail!("could not listen on {}", config.listen);
    }
    let listen_url = broker.listen_url().context("read listen url")?;
    tracing::info!(url = %listen_url, "node listening");

    let pool = Arc::new(WorkerPool::new(config.pool));
    let object = LocalObject::builder("echo")
        .method(METHOD_ECHO, "echo", "echo::(b)->b", |payload| Ok(payload))
        .event(EVENT_TICK, "tick", "tick::(s)")
        .build(pool);
    let id = broker
        .register_service("echo", object.clone())
        .wait()
        .context("register echo service")?;
    tracing::info!(id, "echo service registered");

    // Emit a tick every second so subscribers have something to watch.
    let ticker = object.clone();
    std::thread::spawn(move || {
        let mut seq: u64 = 0;
        loop {
            std::thread::sleep(Duration::from_secs(1));
            seq += 1;
            ticker.meta_emit(EVENT_TICK, Bytes::from(format!("tick {seq}")));
        }
    });

    loop {
        std::thread::park();
    }
}
