pub mod config;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod reporter;
pub mod sampler;
pub mod sequencer;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ControllerConfig, DeviceIdentity, NetworkConfig, PersistedSwitches, RuntimeConfig};
pub use engine::{CommandQueueFull, CommandSource, ReconciliationEngine};
pub use protocol::{decode_inbound, DecodeError, InboundMessage, OutboundMessage, RemoteCommand};
pub use registry::{ConfigError, SwitchRegistry};
pub use relay::{HardwareError, ManualInputs, RelayOutputs};
pub use session::{SessionContext, SignError, Signer};
pub use types::{Line, LineState, ManualMode, SwitchConfigEntry, SwitchView};
