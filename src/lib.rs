#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod transport;

pub use config::{Config, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use events::{Event, EventKind, ListenerId, Payload};
pub use transport::{Connector, Transport, TransportEvent, WsConnector};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
