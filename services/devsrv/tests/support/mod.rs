//! Shared test support: an in-process Modbus TCP slave simulator and
//! device-definition fixtures.

#![allow(dead_code)]

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use devsrv::core::transport::DefaultTransportFactory;
use devsrv::core::{MemoryRepository, PollingRegistry, SessionManager, SessionSettings};
use devsrv::model::DeviceDefinition;
use devsrv::GatewayConfig;

/// Register tables and fault injection for the simulated slave
pub struct SimulatorState {
    pub holding: RwLock<HashMap<u16, u16>>,
    /// Read requests starting at these addresses get an exception response
    pub exceptions: RwLock<HashMap<u16, u8>>,
    /// Accept requests but never answer
    pub silent: AtomicBool,
    /// Milliseconds to wait before answering each request
    pub delay_ms: AtomicU64,
    pub requests: AtomicU32,
    pub writes: RwLock<Vec<Vec<u8>>>,
}

/// Minimal Modbus TCP slave for integration tests
pub struct ModbusTcpSimulator {
    pub addr: SocketAddr,
    pub state: Arc<SimulatorState>,
}

impl ModbusTcpSimulator {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(SimulatorState {
            holding: RwLock::new(HashMap::new()),
            exceptions: RwLock::new(HashMap::new()),
            silent: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            requests: AtomicU32::new(0),
            writes: RwLock::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(socket, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state }
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.holding.write().insert(address, value);
    }

    pub fn set_registers(&self, start: u16, values: &[u16]) {
        let mut holding = self.state.holding.write();
        for (offset, value) in values.iter().enumerate() {
            holding.insert(start + offset as u16, *value);
        }
    }

    /// Make reads starting at `start` fail with the given exception code
    pub fn set_exception(&self, start: u16, code: u8) {
        self.state.exceptions.write().insert(start, code);
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Simulate a slow device
    pub fn set_response_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> u32 {
        self.state.requests.load(Ordering::SeqCst)
    }
}

async fn handle_connection(mut socket: TcpStream, state: Arc<SimulatorState>) {
    loop {
        let mut header = [0u8; 7];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 {
            return;
        }
        let mut pdu = vec![0u8; length - 1];
        if socket.read_exact(&mut pdu).await.is_err() {
            return;
        }

        state.requests.fetch_add(1, Ordering::SeqCst);
        if state.silent.load(Ordering::SeqCst) {
            continue;
        }
        let delay = state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let response_pdu = respond(&state, &pdu);
        let mut adu = Vec::with_capacity(7 + response_pdu.len());
        adu.extend_from_slice(&header[0..4]);
        adu.extend_from_slice(&(response_pdu.len() as u16 + 1).to_be_bytes());
        adu.push(header[6]);
        adu.extend_from_slice(&response_pdu);
        if socket.write_all(&adu).await.is_err() {
            return;
        }
    }
}

fn respond(state: &SimulatorState, pdu: &[u8]) -> Vec<u8> {
    let fc = pdu[0];
    match fc {
        0x03 | 0x04 => {
            let start = u16::from_be_bytes([pdu[1], pdu[2]]);
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            if let Some(code) = state.exceptions.read().get(&start) {
                return vec![fc | 0x80, *code];
            }
            let holding = state.holding.read();
            let mut out = vec![fc, (count * 2) as u8];
            for offset in 0..count {
                let word = holding.get(&(start + offset)).copied().unwrap_or(0);
                out.extend_from_slice(&word.to_be_bytes());
            }
            out
        },
        0x01 | 0x02 => {
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            let bytes = count.div_ceil(8) as usize;
            let mut out = vec![fc, bytes as u8];
            out.extend(std::iter::repeat(0u8).take(bytes));
            out
        },
        0x05 | 0x06 => {
            state.writes.write().push(pdu.to_vec());
            pdu.to_vec()
        },
        0x10 => {
            state.writes.write().push(pdu.to_vec());
            vec![0x10, pdu[1], pdu[2], pdu[3], pdu[4]]
        },
        _ => vec![fc | 0x80, 0x01],
    }
}

/// Base TCP device definition pointing at the simulator
pub fn tcp_device_json(id: &str, addr: SocketAddr) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": "Test Meter",
        "make": "Generic",
        "connection": { "type": "TCP", "ip": addr.ip().to_string(), "port": addr.port(), "unitId": 1 },
        "pollingInterval": 1000,
        "advanced": { "connectionOptions": { "timeout": 1000, "retries": 0, "retryInterval": 0 } },
        "dataPoints": [{
            "range": { "startAddress": 0, "count": 1, "fc": 3 },
            "parser": { "parameters": [{
                "name": "word0", "dataType": "UINT16", "registerIndex": 0
            }]}
        }]
    })
}

pub fn device_from_json(value: serde_json::Value) -> DeviceDefinition {
    serde_json::from_value(value).expect("valid device definition json")
}

/// Registry over a memory repository and real TCP transports
pub fn build_registry(devices: Vec<DeviceDefinition>) -> Arc<PollingRegistry> {
    let repository = Arc::new(MemoryRepository::new());
    for device in devices {
        repository.upsert(device);
    }

    let config = GatewayConfig::default();
    let sessions = SessionManager::new(
        Box::new(DefaultTransportFactory),
        SessionSettings {
            idle_ttl: config.session_idle_ttl(),
            reap_interval: config.reap_interval(),
            default_timeout_ms: config.default_timeout_ms,
        },
    );
    PollingRegistry::new(repository, sessions, config)
}

pub const DEVICE_A: &str = "64a1f20b9d3c4e5f6a7b8c9d";
pub const DEVICE_B: &str = "64a1f20b9d3c4e5f6a7b8c9e";
pub const UNKNOWN_DEVICE: &str = "ffffffffffffffffffffffff";
