//! # meshsim — run a whole mesh in one process
//!
//! Host-side demonstration harness: spawns a sink plus a handful of sensor
//! nodes over the in-process simulated radio medium, routes periodic sensor
//! readings to the sink with the selected protocol, and logs deliveries and
//! the topology CSV.
//!
//! ```text
//! meshsim [scenario.toml]
//! ```
//!
//! Without an argument a default five-node STRP mesh is used. Link RSSI
//! falls off with address distance so the RSSI-driven strategies have
//! something to chew on. `RUST_LOG=debug` shows discovery and forwarding
//! decisions.

use anyhow::Context;
use embassy_executor::{Executor, Spawner};
use embassy_time::{Duration, Timer};
use serde::Deserialize;

use aloha_mesh_routing::mac::sim::{SimMac, SimMedium};
use aloha_mesh_routing::smrp::Smrp;
use aloha_mesh_routing::strp::Strp;
use aloha_mesh_routing::{
    Addr, ParentStrategy, RoutingTransport, SmrpConfig, StrpConfig, MAX_NODES, MAX_PAYLOAD_LEN,
};

/// Upper bound for task pools; one mesh cannot exceed the table size.
const MAX_MESH_NODES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Protocol {
    #[default]
    Strp,
    Smrp,
}

/// Scenario file contents; every field has a default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct Scenario {
    protocol: Protocol,
    strategy: ParentStrategy,
    sink_addr: Addr,
    node_addrs: Vec<Addr>,
    sense_duration_s: u32,
    beacon_interval_s: u32,
    node_timeout_s: u32,
    /// Seconds between readings from each sensor node.
    send_interval_s: u32,
    /// Seconds between topology CSV dumps.
    topology_interval_s: u32,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            protocol: Protocol::Strp,
            strategy: ParentStrategy::Closest,
            sink_addr: 0x0D,
            node_addrs: vec![0x05, 0x07, 0x09, 0x0B],
            sense_duration_s: 10,
            beacon_interval_s: 15,
            node_timeout_s: 45,
            send_interval_s: 10,
            topology_interval_s: 60,
        }
    }
}

/// Either protocol behind one handle, so the harness tasks stay concrete.
#[derive(Clone)]
enum Node {
    Strp(Strp<SimMac>),
    Smrp(Smrp<SimMac>),
}

impl Node {
    fn addr(&self) -> Addr {
        match self {
            Node::Strp(e) => e.self_addr(),
            Node::Smrp(e) => e.self_addr(),
        }
    }

    async fn run(&self) -> Result<(), aloha_mesh_routing::RoutingError> {
        match self {
            Node::Strp(e) => e.run().await,
            Node::Smrp(e) => e.run().await,
        }
    }

    async fn send(&self, dest: Addr, payload: &[u8]) -> bool {
        match self {
            Node::Strp(e) => e.send(dest, payload).await,
            Node::Smrp(e) => e.send(dest, payload).await,
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> (aloha_mesh_routing::RouteHeader, usize) {
        match self {
            Node::Strp(e) => e.recv(buf).await,
            Node::Smrp(e) => e.recv(buf).await,
        }
    }

    fn topology_header(&self) -> &'static str {
        match self {
            Node::Strp(e) => e.topology_header(),
            Node::Smrp(e) => e.topology_header(),
        }
    }

    fn topology_rows(&self, buf: &mut [u8]) -> usize {
        match self {
            Node::Strp(e) => e.topology_rows(buf),
            Node::Smrp(e) => e.topology_rows(buf),
        }
    }
}

#[embassy_executor::task(pool_size = MAX_MESH_NODES)]
async fn engine_task(node: Node, addr: Addr) {
    if let Err(err) = node.run().await {
        log::error!("node {addr:02} stopped: {err}");
        std::process::exit(1);
    }
}

/// Periodic sensor readings toward the sink, staggered by address the way
/// the hardware testbed staggers its nodes.
#[embassy_executor::task(pool_size = MAX_MESH_NODES)]
async fn sensor_task(node: Node, sink: Addr, interval: Duration) {
    let addr = node.addr();
    Timer::after(Duration::from_secs(addr as u64)).await;
    let mut counter = 0u32;
    loop {
        Timer::after(interval).await;
        counter += 1;
        let payload = format!("n{addr:02}-reading-{counter}");
        if node.send(sink, payload.as_bytes()).await {
            log::info!("{addr:02} queued reading {counter}");
        }
    }
}

#[embassy_executor::task]
async fn sink_task(node: Node) {
    let mut buf = [0u8; MAX_PAYLOAD_LEN];
    loop {
        let (header, len) = node.recv(&mut buf).await;
        let payload = String::from_utf8_lossy(&buf[..len]);
        log::info!(
            "sink <- {:02} via {:02} ({} dBm, {len} bytes): {payload}",
            header.src,
            header.prev,
            header.rssi
        );
    }
}

#[embassy_executor::task]
async fn topology_task(nodes: Vec<Node>, interval: Duration) {
    let mut buf = [0u8; 2048];
    loop {
        Timer::after(interval).await;
        if let Some(first) = nodes.first() {
            log::info!("topology: {}", first.topology_header());
        }
        for node in &nodes {
            let len = node.topology_rows(&mut buf);
            for line in String::from_utf8_lossy(&buf[..len]).lines() {
                log::info!("topology[{:02}]: {line}", node.addr());
            }
        }
    }
}

fn build_nodes(scenario: &Scenario, medium: &SimMedium) -> anyhow::Result<Vec<Node>> {
    let mut addrs = vec![scenario.sink_addr];
    addrs.extend(&scenario.node_addrs);

    // signal falls off with address distance
    for (i, &a) in addrs.iter().enumerate() {
        for &b in &addrs[i + 1..] {
            let rssi = -40 - 2 * (a.abs_diff(b) as i16);
            medium.set_link(a, b, Some(rssi));
        }
    }

    addrs
        .iter()
        .map(|&addr| {
            let mac = medium.attach(addr);
            match scenario.protocol {
                Protocol::Strp => Strp::new(
                    StrpConfig {
                        self_addr: addr,
                        sink_addr: scenario.sink_addr,
                        strategy: scenario.strategy,
                        sense_duration_s: scenario.sense_duration_s,
                        beacon_interval_s: scenario.beacon_interval_s,
                        node_timeout_s: scenario.node_timeout_s,
                        ..Default::default()
                    },
                    mac,
                )
                .map(Node::Strp),
                Protocol::Smrp => Smrp::new(
                    SmrpConfig {
                        self_addr: addr,
                        sink_addr: scenario.sink_addr,
                        sense_duration_s: scenario.sense_duration_s,
                        beacon_interval_s: scenario.beacon_interval_s,
                        node_timeout_s: scenario.node_timeout_s,
                        ..Default::default()
                    },
                    mac,
                )
                .map(Node::Smrp),
            }
            .with_context(|| format!("configuring node {addr:02}"))
        })
        .collect()
}

fn spawn_mesh(spawner: Spawner, scenario: Scenario, nodes: Vec<Node>) {
    let sink_addr = scenario.sink_addr;
    let send_interval = Duration::from_secs(scenario.send_interval_s as u64);
    let topology_interval = Duration::from_secs(scenario.topology_interval_s.max(1) as u64);

    for node in &nodes {
        let _ = spawner.spawn(engine_task(node.clone(), node.addr()));
        if node.addr() == sink_addr {
            let _ = spawner.spawn(sink_task(node.clone()));
        } else {
            let _ = spawner.spawn(sensor_task(node.clone(), sink_addr, send_interval));
        }
    }
    let _ = spawner.spawn(topology_task(nodes, topology_interval));
}

fn load_scenario() -> anyhow::Result<Scenario> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(Scenario::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    toml::from_str(&text).with_context(|| format!("parsing {path}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let scenario = load_scenario()?;
    anyhow::ensure!(
        !scenario.node_addrs.is_empty(),
        "scenario needs at least one sensor node"
    );
    anyhow::ensure!(
        scenario
            .node_addrs
            .iter()
            .chain([&scenario.sink_addr])
            .all(|&a| (a as usize) < MAX_NODES),
        "all addresses must be below {MAX_NODES}"
    );
    anyhow::ensure!(
        !scenario.node_addrs.contains(&scenario.sink_addr),
        "the sink cannot double as a sensor node"
    );

    log::info!(
        "mesh: sink {:02}, nodes {:?}, protocol {:?}",
        scenario.sink_addr,
        scenario.node_addrs,
        scenario.protocol
    );

    let medium = SimMedium::new();
    let nodes = build_nodes(&scenario, &medium)?;

    let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
    executor.run(|spawner| spawn_mesh(spawner, scenario, nodes))
}
