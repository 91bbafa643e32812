use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use netsync::net::{MsgState, MsgStateAck};
use netsync::{
    ConnectionId, EntityState, FixedTimestep, GameState, GameStateProcessor, MemoryNetwork,
    MemoryTransport, NetChannel, NetConfig, NetError, NetEvent, NetManager,
};

#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub applied: u32,
    pub extrapolated: u32,
    pub stalled: u32,
}

pub struct DemoClient {
    manager: NetManager<MemoryTransport>,
    connection: ConnectionId,
    states: Receiver<GameState>,
    processor: GameStateProcessor,
    timestep: FixedTimestep,
    tick: u32,
    view: HashMap<u32, EntityState>,
    stats: ClientStats,
    started: Instant,
}

impl DemoClient {
    pub fn connect(
        network: &MemoryNetwork,
        server_addr: SocketAddr,
        username: &str,
        config: &NetConfig,
    ) -> Result<Self, NetError> {
        let (tx, states) = mpsc::channel();
        let mut manager = NetManager::client(config.clone());
        manager.register_message_with(move |_: &NetChannel, msg: MsgState| {
            if let Err(e) = tx.send(msg.state) {
                log::debug!("Dropping game state, client is gone: {}", e);
            }
        })?;
        manager.register_message::<MsgStateAck>()?;

        let connection = manager.connect_client(network.bind_ephemeral()?, server_addr, username)?;

        Ok(Self {
            manager,
            connection,
            states,
            processor: GameStateProcessor::new(config.state_buffer()),
            timestep: FixedTimestep::new(config.tick_rate),
            tick: 0,
            view: HashMap::new(),
            stats: ClientStats::default(),
            started: Instant::now(),
        })
    }

    pub fn session_name(&self) -> Option<&str> {
        self.manager
            .channel(self.connection)
            .ok()
            .map(NetChannel::session_name)
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn view(&self) -> &HashMap<u32, EntityState> {
        &self.view
    }

    pub fn manager(&self) -> &NetManager<MemoryTransport> {
        &self.manager
    }

    pub fn update(&mut self, delta: Duration) {
        self.manager.process_packets();

        for event in self.manager.drain_events() {
            match event {
                NetEvent::Connected { session_name, .. } => {
                    log::info!("Joined as {}", session_name);
                }
                NetEvent::Disconnected { reason, .. } | NetEvent::ConnectFailed { reason, .. } => {
                    log::warn!("Lost connection: {}", reason);
                    self.processor.reset();
                    self.view.clear();
                }
            }
        }

        for _ in 0..self.timestep.advance(delta) {
            self.run_tick();
        }
    }

    fn run_tick(&mut self) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        for state in self.states.try_iter() {
            self.processor.add_state(state, now_ms);
        }

        let result = self.processor.process_tick_states(&mut self.tick);
        match result.current {
            Some(current) if current.extrapolated => self.stats.extrapolated += 1,
            Some(current) => {
                for state in &result.catch_up {
                    state.apply_to(&mut self.view);
                }
                current.apply_to(&mut self.view);
                self.stats.applied += 1;

                let ack = MsgStateAck {
                    tick: current.to_tick,
                };
                if let Err(e) = self.manager.send_message(self.connection, &ack) {
                    log::debug!("Could not acknowledge tick {}: {}", current.to_tick, e);
                }
            }
            None => self.stats.stalled += 1,
        }

        self.tick += 1;
    }

    pub fn shutdown(&mut self) {
        self.manager.shutdown("Client quit");
    }
}
