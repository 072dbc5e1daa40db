//! KernelDescriptor and CompiledKernel: the caller-supplied identity of a
//! kernel and the immutable artifact the code-emitter produces for it.
//!
//! Grounded on `emu_core`'s `compile.rs` (`Spirv<P>`/`SpirvBuilder`, the
//! params+name+code shape) and `device.rs` (`DeviceFnMut`, the
//! bind-group-layout-plus-pipeline artifact) — here generalized across
//! PTX/OpenCL/CPU instead of only wgpu/SPIR-V.

use crate::accelerator::BackendTag;
use crate::parameter::ParameterKind;
use std::hash::{Hash, Hasher};

/// Compile-time constants / optimization level attached to a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Specialization {
    pub constants: Vec<(String, i64)>,
    pub optimization_level: u8,
}

/// The caller-supplied identity of a kernel to compile. Two descriptors
/// with identical identifier, parameter list, and specialization are
/// interchangeable (spec §3 invariant).
#[derive(Debug, Clone)]
pub struct KernelDescriptor {
    pub identifier: String,
    pub parameters: Vec<ParameterKind>,
    pub specialization: Specialization,
    /// Whether the loader must reserve an injected extent argument because
    /// thread grouping is computed by the runtime rather than the caller.
    pub implicitly_grouped: bool,
}

impl KernelDescriptor {
    pub fn new(identifier: impl Into<String>, parameters: Vec<ParameterKind>) -> Self {
        Self {
            identifier: identifier.into(),
            parameters,
            specialization: Specialization::default(),
            implicitly_grouped: false,
        }
    }

    pub fn grouped(mut self) -> Self {
        self.implicitly_grouped = true;
        self
    }

    pub fn with_specialization(mut self, specialization: Specialization) -> Self {
        self.specialization = specialization;
        self
    }

    /// A fingerprint of the parameter list stable across identical ABI
    /// shapes (equivalent struct layouts hash equally) — used verbatim in
    /// cache-key construction by [`crate::loader`].
    pub fn param_type_fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for p in &self.parameters {
            match p {
                ParameterKind::Primitive { bit_width, signed, float } => {
                    0u8.hash(&mut hasher);
                    bit_width.hash(&mut hasher);
                    signed.hash(&mut hasher);
                    float.hash(&mut hasher);
                }
                ParameterKind::View { element_bit_width, pointer_align } => {
                    1u8.hash(&mut hasher);
                    element_bit_width.hash(&mut hasher);
                    pointer_align.hash(&mut hasher);
                }
                ParameterKind::Struct { layout } => {
                    2u8.hash(&mut hasher);
                    layout.size.hash(&mut hasher);
                    layout.align.hash(&mut hasher);
                }
                ParameterKind::Unsupported(detail) => {
                    3u8.hash(&mut hasher);
                    detail.hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }

    pub fn specialization_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.specialization.hash(&mut hasher);
        hasher.finish()
    }
}

/// The ABI-level description of a kernel: parameter offsets, index type,
/// shared-memory usage.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EntryPoint {
    pub name: String,
    pub parameter_offsets: Vec<usize>,
    pub total_size: usize,
    pub uses_dynamic_shared_memory: bool,
    /// Bit width of the kernel index type, e.g. 32 for `cl_uint`/`u32`,
    /// None when the entry point is not implicitly grouped.
    pub kernel_index_type: Option<u32>,
}

/// Diagnostics produced alongside a successful compilation (warnings,
/// resource usage estimates, etc). Purely informational.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct KernelInfo {
    pub diagnostics: Vec<String>,
    pub register_count: Option<u32>,
}

/// The opaque payload a code-emitter produces: PTX text, OpenCL C source,
/// or a CPU function pointer token. Out-of-scope collaborators produce
/// this; the core only stores and hashes it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KernelBlob {
    PtxSource(String),
    OpenClSource { source: String, language_version: String },
    CpuEntryToken(String),
}

/// Immutable artifact produced by compiling a [`KernelDescriptor`] for one
/// backend. Equality is by backend tag + source hash + entry-point
/// fingerprint (spec §4.3); neither source nor layout mutate after
/// construction, and it is freely shareable — disposal is a no-op, the
/// cache owns its lifetime.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompiledKernel {
    pub backend: BackendTag,
    pub blob: KernelBlob,
    pub entry_point: EntryPoint,
    pub info: Option<KernelInfo>,
    /// e.g. `"CL1.2"`, `"CL3.0"`, or `"native"` for PTX/CPU.
    pub language_version: String,
}

impl CompiledKernel {
    fn source_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        match &self.blob {
            KernelBlob::PtxSource(s) => s.hash(&mut hasher),
            KernelBlob::OpenClSource { source, language_version } => {
                source.hash(&mut hasher);
                language_version.hash(&mut hasher);
            }
            KernelBlob::CpuEntryToken(s) => s.hash(&mut hasher),
        }
        hasher.finish()
    }

    fn entry_point_fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.entry_point.name.hash(&mut hasher);
        self.entry_point.parameter_offsets.hash(&mut hasher);
        self.entry_point.total_size.hash(&mut hasher);
        self.entry_point.uses_dynamic_shared_memory.hash(&mut hasher);
        self.entry_point.kernel_index_type.hash(&mut hasher);
        hasher.finish()
    }
}

impl PartialEq for CompiledKernel {
    fn eq(&self, other: &Self) -> bool {
        self.backend == other.backend
            && self.source_hash() == other.source_hash()
            && self.entry_point_fingerprint() == other.entry_point_fingerprint()
    }
}
impl Eq for CompiledKernel {}

/// Parses an OpenCL C version tag from the patterns the emitter may report:
/// `"CL1.2"`, `"OpenCL C 2.0"`, or a bare `"2.0"`.
pub fn parse_opencl_version(raw: &str) -> Option<(u32, u32)> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    let mut parts = digits.splitn(2, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}
