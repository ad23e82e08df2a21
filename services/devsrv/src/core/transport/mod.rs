//! Transport layer: byte pipes over TCP sockets and serial ports

pub mod factory;
pub mod mock;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use factory::{DefaultTransportFactory, TransportFactory};
pub use mock::{ExchangeRecord, MockAction, MockTransport};
pub use serial::{SerialSettings, SerialTransport};
pub use tcp::TcpTransport;
pub use traits::{ExceptionCode, Transport, TransportError};
