pub use crate::backend::host::{Host, HostError};
pub use crate::error::{Error, Result};
pub use itertools::Itertools;
pub use std::path::{Path, PathBuf};
pub use tracing::{debug, error, info, trace, warn};
