//! Device capabilities, transports and drivers
//!
//! Capability traits live in [`capabilities`]. Real instruments reach the
//! lab over a Telnet/SCPI [`transport`] or EPICS [`channel_access`];
//! [`simulated`] devices need neither.

pub mod arp;
pub mod capabilities;
pub mod channel_access;
pub mod libera_epics;
pub mod mock;
pub mod rc4dat;
pub mod rigol_dsg3030;
pub mod simulated;
pub mod spark_er;
pub mod transport;

pub use capabilities::{Attenuator, BpmDevice, Channel, GateSource, RfSource};
pub use channel_access::ChannelAccess;
pub use libera_epics::{ElectronBpm, SparkErEpicsBpm};
pub use mock::{MockChannelAccess, MockLineTransport};
pub use rc4dat::Rc4datAttenuator;
pub use rigol_dsg3030::{Rigol3030GateSource, Rigol3030RfSource};
pub use simulated::{SimulatedAttenuator, SimulatedBpm, SimulatedGateSource, SimulatedRfSource};
pub use spark_er::SparkErScpiBpm;
pub use transport::{LineTransport, TelnetTransport, TelnetTransportBuilder};
