//! KNX protocol layer: addressing, datapoint codec, cEMI and KNXnet/IP
//! framing, and the bus link used by both the daemon and the monitor CLI.

pub mod address;
pub mod cemi;
pub mod dpt;
pub mod netip;
pub mod transport;

pub use address::{DeviceAddress, GroupAddress};
pub use cemi::{Apci, CemiFrame, GroupEvent, Payload};
pub use dpt::{DptId, GroupValue};
pub use transport::{ConnectionState, KnxLink};
