//! Koatty Core — metadata store, framework exceptions, protocol set, and the
//! IOC registry seam shared by the runtime.

pub mod error;
pub mod exception;
pub mod ioc;
pub mod metadata;
pub mod protocol;

pub use error::KoattyError;
pub use exception::{is_prevent, Exception, DEFAULT_ERROR_CODE, PREVENT_NEXT_PROCESS};
pub use ioc::{Capabilities, ComponentClass, ComponentKind, IocRegistry, MemoryContainer};
pub use metadata::{Metadata, MetadataValue};
pub use protocol::{KoattyProtocol, UnknownProtocol};
