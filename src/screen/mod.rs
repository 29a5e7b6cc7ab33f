pub mod capture;
pub mod encoder;
pub mod rate;
pub mod source;
pub mod viewer;

/// Capture delay while someone watches the local preview (~60 fps)
pub const ACTIVE_INTERVAL_MS: u64 = 16;
/// Capture delay while nobody is watching (~10 fps)
pub const IDLE_INTERVAL_MS: u64 = 100;
/// Delay multiplier once the producer is backgrounded
pub const HIDDEN_PENALTY: u32 = 3;
/// Backgrounded producers never capture faster than this
pub const HIDDEN_FLOOR_MS: u64 = 100;
