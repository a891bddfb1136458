//! Block definitions: inheritance resolution, registry cache and builtin
//! system blocks.

mod registry;
mod resolver;
mod seed;

pub use registry::{BlockRegistry, ResolvedBlock};
pub use resolver::{deep_merge, resolve_all};
pub use seed::system_blocks;
