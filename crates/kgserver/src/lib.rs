//! This module contains the implementation of the kernel gateway: sessions
//! for spawned Jupyter kernels, multiplexed over websockets.

#![allow(missing_docs)]

pub mod audit;
pub mod channel_pair;
pub mod client_connection;
pub mod config;
pub mod connection_file;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod kernel_catalog;
pub mod kernel_process;
pub mod provisioner;
pub mod server;
pub mod session;
pub mod session_registry;
pub mod shutdown;
pub mod transport;
pub mod wire_message;
pub mod zmq_transport;
