//! Application Ports (Driver and Driven)
//!
//! Ports define the interfaces the bridge uses to reach external systems.
//! - **Broker** (driven): the MQTT connection that topics are subscribed on
//! - **Frame sender** (driven): the host channel frames are pushed to

mod broker_port;
mod frame_sender_port;

pub use broker_port::{BrokerClient, BrokerError, InvalidQos, MessageHandler, QosLevel};
#[cfg(test)]
pub use broker_port::MockBrokerClient;
pub use frame_sender_port::{ChannelFrameSender, FrameSender, SendError};
