//! Backend-neutral parameter description: [`ParameterKind`] and [`View`].

use crate::layout::Layout;

/// Tagged variant describing one kernel parameter's shape, independent of
/// any particular backend's wire format. The mapper rejects
/// [`ParameterKind::Unsupported`] with `Error::UnsupportedParameter`.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterKind {
    Primitive {
        bit_width: u32,
        signed: bool,
        float: bool,
    },
    View {
        element_bit_width: u32,
        pointer_align: usize,
    },
    Struct {
        layout: Layout,
    },
    /// Non-POD reference types, runtime-reflective types, closures — the
    /// mapper has no marshalling rule for these. Carries a human-readable
    /// description for the resulting `UnsupportedParameter` error.
    Unsupported(String),
}

/// A fat-pointer descriptor: device pointer plus element count. On
/// PTX-style backends this is marshalled as a contiguous struct; on
/// OpenCL-style backends the pointer is extracted into a dedicated
/// `cl_mem`-style slot and the length (if present) follows as a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub device_ptr: u64,
    pub len: u64,
}

impl View {
    pub fn new(device_ptr: u64, len: u64) -> Self {
        Self { device_ptr, len }
    }

    /// A view whose device pointer is null. Passed through unchanged; the
    /// kernel-side null check (if any) is the caller's responsibility.
    pub fn null(len: u64) -> Self {
        Self { device_ptr: 0, len }
    }

    pub fn is_null(&self) -> bool {
        self.device_ptr == 0
    }
}
