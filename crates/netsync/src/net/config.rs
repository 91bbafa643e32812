use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use super::protocol::{DEFAULT_PORT, DEFAULT_TICK_RATE, NetError};
use super::stats::PacketLossSimulation;
use crate::state::{DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MIN_BUFFER_SIZE, StateBufferConfig};

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub port: u16,
    /// Comma separated list of addresses the server listens on.
    pub bind_addresses: String,
    pub tick_rate: u32,
    pub command_rate: u32,
    /// Outgoing bytes per second per transport, 0 for unlimited.
    pub rate_limit: u32,
    pub min_buffer_size: usize,
    pub max_buffer_size: usize,
    pub extrapolation: bool,
    pub shutdown_timeout: Duration,

    pub sim_loss_percent: f32,
    pub sim_min_latency_ms: u32,
    pub sim_max_latency_ms: u32,
    pub sim_jitter_ms: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addresses: "0.0.0.0".to_string(),
            tick_rate: DEFAULT_TICK_RATE,
            command_rate: DEFAULT_TICK_RATE,
            rate_limit: 0,
            min_buffer_size: DEFAULT_MIN_BUFFER_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            extrapolation: false,
            shutdown_timeout: Duration::from_secs(2),
            sim_loss_percent: 0.0,
            sim_min_latency_ms: 0,
            sim_max_latency_ms: 0,
            sim_jitter_ms: 0,
        }
    }
}

impl NetConfig {
    pub const KEYS: &'static [&'static str] = &[
        "net.port",
        "net.bindto",
        "net.tickrate",
        "net.cmdrate",
        "net.ratelimit",
        "net.buffer_min",
        "net.buffer_max",
        "net.extrapolation",
        "net.shutdown_timeout_ms",
        "net.sim_loss",
        "net.sim_min_latency",
        "net.sim_max_latency",
        "net.sim_jitter",
    ];

    /// Applies one key/value setting.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), NetError> {
        match key {
            "net.port" => self.port = parse(key, value)?,
            "net.bindto" => {
                parse_bind_list(value, self.port)?;
                self.bind_addresses = value.to_string();
            }
            "net.tickrate" => self.tick_rate = parse_nonzero(key, value)?,
            "net.cmdrate" => self.command_rate = parse_nonzero(key, value)?,
            "net.ratelimit" => self.rate_limit = parse(key, value)?,
            "net.buffer_min" => self.min_buffer_size = parse(key, value)?,
            "net.buffer_max" => self.max_buffer_size = parse(key, value)?,
            "net.extrapolation" => self.extrapolation = parse(key, value)?,
            "net.shutdown_timeout_ms" => {
                self.shutdown_timeout = Duration::from_millis(parse(key, value)?)
            }
            "net.sim_loss" => {
                let percent: f32 = parse(key, value)?;
                if !(0.0..=100.0).contains(&percent) {
                    return Err(NetError::Config(format!("{key} must be within 0-100")));
                }
                self.sim_loss_percent = percent;
            }
            "net.sim_min_latency" => self.sim_min_latency_ms = parse(key, value)?,
            "net.sim_max_latency" => self.sim_max_latency_ms = parse(key, value)?,
            "net.sim_jitter" => self.sim_jitter_ms = parse(key, value)?,
            _ => return Err(NetError::Config(format!("unknown setting {key}"))),
        }
        Ok(())
    }

    pub fn bind_addrs(&self) -> Result<Vec<SocketAddr>, NetError> {
        parse_bind_list(&self.bind_addresses, self.port)
    }

    pub fn state_buffer(&self) -> StateBufferConfig {
        StateBufferConfig {
            min_buffer_size: self.min_buffer_size,
            max_buffer_size: self.max_buffer_size,
            extrapolation: self.extrapolation,
        }
    }

    /// Loss and latency knobs. Only honored in debug builds.
    pub fn simulation(&self) -> PacketLossSimulation {
        let enabled = cfg!(debug_assertions)
            && (self.sim_loss_percent > 0.0
                || self.sim_max_latency_ms > 0
                || self.sim_jitter_ms > 0);
        PacketLossSimulation {
            enabled,
            loss_percent: self.sim_loss_percent,
            min_latency_ms: self.sim_min_latency_ms,
            max_latency_ms: self.sim_max_latency_ms,
            jitter_ms: self.sim_jitter_ms,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, NetError> {
    value
        .trim()
        .parse()
        .map_err(|_| NetError::Config(format!("invalid value {value:?} for {key}")))
}

fn parse_nonzero(key: &str, value: &str) -> Result<u32, NetError> {
    match parse(key, value)? {
        0 => Err(NetError::Config(format!("{key} must be positive"))),
        n => Ok(n),
    }
}

fn parse_bind_list(list: &str, port: u16) -> Result<Vec<SocketAddr>, NetError> {
    let addrs = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map(|ip| SocketAddr::new(ip, port))
                .map_err(|_| NetError::Config(format!("invalid bind address {s:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if addrs.is_empty() {
        return Err(NetError::Config("no bind addresses".to_string()));
    }
    Ok(addrs)
}
