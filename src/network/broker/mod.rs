//! Broker-mediated transport
//!
//! `server` is the shared topic log itself, `client` the transport backend
//! that produces to and consumes from it.

pub mod client;
pub mod server;

pub use client::{BrokerConnection, BrokerConsumer, BrokerProducer, BrokerTransport};
pub use server::{BrokerRequest, BrokerResponse, BrokerSession, LogBroker, Record};
