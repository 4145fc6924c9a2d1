//! Relays text messages published on an MQTT topic to SMS.
//!
//! Data flows broker → [`broker::BrokerSession`] → [`relay::RelayController`]
//! → [`carrier::CarrierGateway`]; connection status flows from the session
//! into the [`status::StatusBus`]. The [`supervisor::Supervisor`] owns the
//! whole pipeline and keeps at most one of it alive.

pub mod broker;
pub mod carrier;
pub mod config;
pub mod credentials;
pub mod indicator;
pub mod relay;
pub mod status;
pub mod supervisor;
