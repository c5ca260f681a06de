//! Surface registry and presentation driver over the buffer latching core.
//!
//! Clients submit through [`SurfaceRegistry`] from any thread. One
//! [`PresentationActor`] per display pipeline latches surfaces on each
//! refresh, reports displayed buffers and applies acquire-fence signals.

mod actor;
mod config;
mod registry;

pub use actor::PresentationActor;
pub use config::{BufferLatchConfig, ConfigError, DEFAULT_FENCE_EVENT_CAPACITY};
pub use registry::{AcquireFenceTag, RegistryError, Surface, SurfaceRegistry};
