//! Transport construction from connection settings

use std::time::Duration;

use super::serial::{SerialSettings, SerialTransport};
use super::tcp::TcpTransport;
use super::traits::Transport;
use crate::model::Connection;

/// Builds transports for the session manager
///
/// Tests swap this for a factory producing scripted mocks.
pub trait TransportFactory: Send + Sync {
    fn create(&self, connection: &Connection, connect_timeout: Duration) -> Box<dyn Transport>;
}

/// Production factory: TCP sockets and serial ports
#[derive(Debug, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, connection: &Connection, connect_timeout: Duration) -> Box<dyn Transport> {
        match connection {
            Connection::Tcp { ip, port, .. } => {
                Box::new(TcpTransport::new(ip, *port, connect_timeout))
            },
            Connection::Rtu {
                serial_port,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
                ..
            } => Box::new(SerialTransport::new(SerialSettings {
                port: serial_port.clone(),
                baud_rate: *baud_rate,
                data_bits: *data_bits,
                stop_bits: *stop_bits,
                parity: *parity,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parity;

    #[test]
    fn test_factory_selects_transport_kind() {
        let factory = DefaultTransportFactory;

        let tcp = factory.create(
            &Connection::Tcp {
                ip: "10.0.0.9".to_string(),
                port: 502,
                unit_id: 1,
            },
            Duration::from_secs(5),
        );
        assert_eq!(tcp.transport_type(), "tcp");

        let rtu = factory.create(
            &Connection::Rtu {
                serial_port: "/dev/ttyUSB3".to_string(),
                baud_rate: 19200,
                data_bits: 8,
                stop_bits: 1,
                parity: Parity::Even,
                unit_id: 2,
            },
            Duration::from_secs(5),
        );
        assert_eq!(rtu.transport_type(), "rtu");
    }
}
