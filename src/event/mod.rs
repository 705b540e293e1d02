//! Plain event structs and handler traits: the crate's structured-logging surface (§ ambient
//! stack). A caller supplies an implementation of [`cmap::CmapEventHandler`] and/or
//! [`sdam::SdamEventHandler`]; when the `tracing-unstable` feature is enabled the same events are
//! additionally emitted as `tracing` events so a caller need not implement either trait just to
//! get log lines.

pub mod cmap;
pub mod sdam;

pub use self::cmap::{CmapEvent, CmapEventHandler};
pub use self::sdam::{SdamEvent, SdamEventHandler};
