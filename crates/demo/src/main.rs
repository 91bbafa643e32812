mod client;
mod world;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use client::DemoClient;
use netsync::net::{MsgState, MsgStateAck};
use netsync::{
    ConnectionId, FixedTimestep, MemoryNetwork, NetChannel, NetConfig, NetEvent, NetManager,
};
use world::DemoWorld;

#[derive(Parser)]
#[command(name = "netsync-demo")]
#[command(about = "Runs a server and several clients over an in-process network")]
struct Args {
    #[arg(short, long, default_value_t = 3)]
    clients: usize,

    #[arg(short, long, default_value_t = 4)]
    entities: u32,

    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    #[arg(short, long, default_value_t = netsync::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value = "player", help = "Username shared by every client")]
    username: String,

    #[arg(long, help = "Extrapolate instead of stalling when states run out")]
    extrapolation: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,

    #[arg(long = "set", value_name = "KEY=VALUE", help = "Extra network setting")]
    settings: Vec<String>,
}

fn build_config(args: &Args) -> Result<NetConfig> {
    let mut config = NetConfig {
        bind_addresses: "127.0.0.1".to_string(),
        tick_rate: args.tick_rate,
        extrapolation: args.extrapolation,
        sim_loss_percent: args.loss_percent,
        sim_min_latency_ms: args.min_latency,
        sim_max_latency_ms: args.max_latency,
        sim_jitter_ms: args.jitter,
        ..Default::default()
    };

    for setting in &args.settings {
        let (key, value) = setting
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got {setting:?}"))?;
        config.set(key, value)?;
    }
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = build_config(&args)?;

    let network = MemoryNetwork::new();
    let (ack_tx, acks) = mpsc::channel::<(ConnectionId, u32)>();

    let mut server = NetManager::server(config.clone());
    server.register_message::<MsgState>()?;
    server.register_message_with(move |channel: &NetChannel, msg: MsgStateAck| {
        if let Err(e) = ack_tx.send((channel.connection(), msg.tick)) {
            log::debug!("Dropping ack for tick {}: {}", msg.tick, e);
        }
    })?;
    server.start_server(|addr| network.bind(addr))?;
    let server_addr = server
        .local_addrs()
        .first()
        .copied()
        .context("server has no listening address")?;

    let mut clients = (0..args.clients)
        .map(|_| DemoClient::connect(&network, server_addr, &args.username, &config))
        .collect::<Result<Vec<_>, _>>()?;

    let mut world = DemoWorld::new(args.entities);
    let mut timestep = FixedTimestep::new(config.tick_rate);
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut last_frame = Instant::now();

    while Instant::now() < deadline {
        let now = Instant::now();
        let delta = now - last_frame;
        last_frame = now;

        server.process_packets();
        for (connection, tick) in acks.try_iter() {
            world.ack(connection, tick);
        }
        for event in server.drain_events() {
            match event {
                NetEvent::Connected {
                    session_name,
                    remote_addr,
                    ..
                } => log::info!("Client {} joined from {}", session_name, remote_addr),
                NetEvent::Disconnected {
                    connection,
                    session_name,
                    reason,
                } => {
                    log::info!("Client {} left: {}", session_name, reason);
                    world.forget(connection);
                }
                NetEvent::ConnectFailed { .. } => {}
            }
        }

        for _ in 0..timestep.advance(delta) {
            world.step();
            let targets: Vec<ConnectionId> =
                server.channels().map(NetChannel::connection).collect();
            for connection in targets {
                let state = world.state_for(connection);
                if let Err(e) = server.send_message(connection, &MsgState { state }) {
                    log::warn!("Failed to send state to {}: {}", connection, e);
                }
            }
        }

        for client in &mut clients {
            client.update(delta);
        }

        thread::sleep(Duration::from_millis(1));
    }

    log::info!("Server reached tick {}", world.tick());
    for client in &mut clients {
        let stats = client.stats();
        let transport = client.manager().transports().first().map(|t| t.stats().clone());
        log::info!(
            "{}: tick {}, applied {}, extrapolated {}, stalled {}, {} entities, {:?}",
            client.session_name().unwrap_or("<not connected>"),
            client.tick(),
            stats.applied,
            stats.extrapolated,
            stats.stalled,
            client.view().len(),
            transport,
        );
        if let Some(position) = client.view().get(&1).and_then(world::decode_position) {
            log::info!("  entity 1 at ({:.2}, {:.2})", position[0], position[1]);
        }
        client.shutdown();
    }

    server.shutdown("Server shutting down");
    Ok(())
}
