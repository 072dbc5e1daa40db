//! Cross-backend GPU compute runtime: the kernel compilation, caching, and
//! dispatch core.
//!
//! Authoring the kernel source language, the IR optimizer, device driver
//! APIs, and a GPU memory allocator are treated as external collaborators
//! or are out of scope entirely (see each module's doc comment for its
//! specific seam). What lives here is the pipeline that turns a
//! [`kernel::KernelDescriptor`] plus an [`accelerator::Accelerator`] into a
//! cached, ABI-correct, asynchronously-dispatchable kernel launch.

pub mod accelerator;
pub mod cache;
pub mod config;
pub mod error;
pub mod kernel;
pub mod launch;
pub mod layout;
pub mod loader;
pub mod mapper;
pub mod parameter;
pub mod registry;
pub mod stream;

pub mod prelude {
    pub use crate::accelerator::{Accelerator, BackendTag, Capability};
    pub use crate::cache::{CacheKey, CacheStatistics, KernelCache, Metadata};
    pub use crate::config::{CacheConfig, RuntimeConfig};
    pub use crate::error::{Error, Result};
    pub use crate::kernel::{CompiledKernel, EntryPoint, KernelBlob, KernelDescriptor, KernelInfo, Specialization};
    pub use crate::launch::{spawn, AsyncLaunch, CancellationToken, LaunchConfig, LaunchOutcome};
    pub use crate::layout::Layout;
    pub use crate::loader::{CachedKernel, CodeEmitter, Driver, KernelLoader};
    pub use crate::mapper::{Argument, MarshalledBuffer, SetArgCall};
    pub use crate::parameter::{ParameterKind, View};
    pub use crate::registry::AcceleratorKernelCache;
    pub use crate::stream::{DispatchState, Stream};
}
