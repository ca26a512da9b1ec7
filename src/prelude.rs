//! Internal prelude for common imports.
//!
//! This module provides commonly used types and traits that are imported
//! throughout the crate. Use `use crate::prelude::*;` in internal modules.

// Re-export standard library types
pub use std::path::{Path, PathBuf};
pub use std::sync::{Arc, Weak};
pub use std::time::{Duration, Instant};

// Re-export common external crates
pub use dashmap::DashMap;
pub use parking_lot::{Condvar, Mutex, ReentrantMutex};
pub use serde::{Deserialize, Serialize};

// Re-export shared types
pub use crate::error::CommonError;
pub use crate::types::Timer;
