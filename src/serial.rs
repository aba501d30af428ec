//! Everything between the wire surface and the hardware: settings, the driver
//! seam, discovery, sessions and the streaming fan-out.

/// Port settings value objects and validation.
pub mod settings;

/// The driver adapter: the only seam that touches the serial library.
pub mod driver;

/// Port discovery and classification.
pub mod scanner;

/// Session ownership, locking and statistics.
pub mod manager;

/// Continuous reading with multi-subscriber fan-out.
pub mod reader;
