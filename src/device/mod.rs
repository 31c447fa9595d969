//! Device model: capability traits, per-device session state, native status
//! values and the connection seam.

pub mod capabilities;
pub mod connection;
pub mod session;
pub mod state;

pub use capabilities::{
    Capabilities, Device, Finalizable, Recorder, Startable, Stoppable, Testable, Validatable,
    Verifiable,
};
pub use connection::{Connection, ConnectionFactory, ConnectionSlot, Endpoint, Serialization};
pub use session::{Artifact, RecordingProfile, RecordingWindow, Session};
pub use state::{CameraStatus, Coarse, DeviceState};
