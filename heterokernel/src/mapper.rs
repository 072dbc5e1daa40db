//! ArgumentMapper: per-backend marshalling of a caller argument tuple into
//! device-ready call data.
//!
//! Grounded on `emu_core`'s `device.rs` (`DeviceFnMutArgs`/`ArgBuilder`,
//! which walks a parameter list building bind-group entries at call time)
//! and `avx-gpu-core`'s `kernel.rs` (`KernelArg`/`KernelArgValue`, the
//! Buffer-vs-Scalar argument split). PTX buffer-mode packing follows spec
//! §4.2's algorithm; OpenCL set-arg mode follows the same section's second
//! algorithm.

use crate::accelerator::BackendTag;
use crate::error::{Error, Result};
use crate::kernel::EntryPoint;
use crate::layout::{align_up, VIEW_ALIGN, VIEW_SIZE};
use crate::parameter::{ParameterKind, View};

/// One concrete argument value supplied by the caller at launch time.
#[derive(Debug, Clone)]
pub enum Argument {
    Scalar(Vec<u8>),
    View(View),
}

impl Argument {
    pub fn scalar<T: bytemuck::Pod>(value: T) -> Self {
        Argument::Scalar(bytemuck::bytes_of(&value).to_vec())
    }
}

/// PTX/CPU buffer-mode output: a single contiguous byte buffer plus its
/// size, consumed directly by the driver launch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshalledBuffer {
    pub bytes: Vec<u8>,
}

/// One `set_kernel_argument(kernel, index, size, &value)` call, in the
/// OpenCL set-arg style.
#[derive(Debug, Clone)]
pub struct SetArgCall {
    pub index: usize,
    pub size: usize,
    pub bytes: Vec<u8>,
}

/// Fixed offset reserved for the kernel-index-extent slot when an entry
/// point is implicitly grouped, in PTX buffer mode.
pub const KERNEL_PARAM_DIMENSION_INDEX: usize = 0;

fn arg_bytes(arg: &Argument, kind: &ParameterKind) -> Result<Vec<u8>> {
    match (arg, kind) {
        (Argument::Scalar(bytes), ParameterKind::Primitive { .. } | ParameterKind::Struct { .. }) => {
            Ok(bytes.clone())
        }
        (Argument::View(v), ParameterKind::View { .. }) => {
            let mut out = Vec::with_capacity(VIEW_SIZE);
            out.extend_from_slice(&v.device_ptr.to_ne_bytes());
            out.extend_from_slice(&v.len.to_ne_bytes());
            Ok(out)
        }
        _ => Err(Error::UnsupportedParameter {
            detail: format!("argument/parameter kind mismatch: {:?} vs {:?}", arg, kind),
        }),
    }
}

/// Builds the PTX-style marshalled buffer for a parameter list and caller
/// argument tuple (spec §4.2, buffer-mode algorithm).
pub fn marshal_ptx_buffer(
    params: &[ParameterKind],
    args: &[Argument],
    entry_point: &EntryPoint,
) -> Result<MarshalledBuffer> {
    if params.len() != args.len() {
        return Err(Error::UnsupportedParameter {
            detail: format!("expected {} arguments, got {}", params.len(), args.len()),
        });
    }
    let mut bytes = Vec::new();
    if let Some(bits) = entry_point.kernel_index_type {
        // Implicitly grouped: reserve the dimension-index slot ahead of
        // user parameters.
        debug_assert_eq!(KERNEL_PARAM_DIMENSION_INDEX, 0);
        let size = (bits as usize).div_ceil(8);
        bytes.resize(size, 0);
    }
    for (kind, arg) in params.iter().zip(args) {
        let l = crate::layout::layout_of(kind, BackendTag::Ptx)?;
        let offset = l.align_up(bytes.len());
        bytes.resize(offset, 0);
        bytes.extend_from_slice(&arg_bytes(arg, kind)?);
    }
    let max_align = params
        .iter()
        .map(|p| crate::layout::layout_of(p, BackendTag::Ptx).map(|l| l.align))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .max()
        .unwrap_or(1);
    bytes.resize(align_up(bytes.len(), max_align.max(1)), 0);

    let expected = entry_point.total_size;
    if expected != 0 && expected != bytes.len() {
        return Err(Error::LayoutMismatch { expected, actual: bytes.len() });
    }
    Ok(MarshalledBuffer { bytes })
}

/// Builds the OpenCL-style `set_kernel_arg` call sequence (spec §4.2,
/// set-arg-mode algorithm). Returns the calls; the caller is responsible
/// for OR-ing the driver's per-call status and raising
/// `Error::ArgumentMapping` on a non-zero result — this function itself
/// never talks to a driver.
pub fn marshal_opencl_args(
    params: &[ParameterKind],
    args: &[Argument],
    entry_point: &EntryPoint,
) -> Result<Vec<SetArgCall>> {
    if params.len() != args.len() {
        return Err(Error::UnsupportedParameter {
            detail: format!("expected {} arguments, got {}", params.len(), args.len()),
        });
    }
    let mut calls = Vec::new();
    let mut index = 0usize;
    if entry_point.uses_dynamic_shared_memory {
        // Reserve indices 0 and 1 for (shared_buffer, shared_size).
        calls.push(SetArgCall { index: 0, size: VIEW_ALIGN, bytes: vec![0u8; VIEW_ALIGN] });
        calls.push(SetArgCall { index: 1, size: 4, bytes: 0u32.to_ne_bytes().to_vec() });
        index = 2;
    }
    // Step 2: each view parameter, in order, extracts its raw device
    // pointer as a single pointer-typed argument.
    for (kind, arg) in params.iter().zip(args) {
        if let (ParameterKind::View { .. }, Argument::View(v)) = (kind, arg) {
            calls.push(SetArgCall {
                index,
                size: std::mem::size_of::<u64>(),
                bytes: v.device_ptr.to_ne_bytes().to_vec(),
            });
            index += 1;
        }
    }
    // Step 3: implicitly-grouped kernels get one argument for the kernel
    // length (index type).
    if let Some(bits) = entry_point.kernel_index_type {
        let size = (bits as usize).div_ceil(8);
        calls.push(SetArgCall { index, size, bytes: vec![0u8; size] });
        index += 1;
    }
    // Step 4: remaining (non-view) user arguments, each mapped by its
    // ParameterKind. Sub-views are never re-marshalled; only the fat
    // pointer already emitted in step 2 is passed.
    for (kind, arg) in params.iter().zip(args) {
        if matches!(kind, ParameterKind::View { .. }) {
            continue;
        }
        let bytes = arg_bytes(arg, kind)?;
        calls.push(SetArgCall { index, size: bytes.len(), bytes });
        index += 1;
    }
    Ok(calls)
}

/// OR's a set of driver-reported per-argument status codes the way the
/// OpenCL set-arg algorithm requires (spec §4.2 step 5): non-zero raises
/// `ArgumentMappingFailure` naming the first offending index.
pub fn check_opencl_statuses(statuses: &[(usize, i64)]) -> Result<()> {
    let ored = statuses.iter().fold(0i64, |acc, (_, s)| acc | s);
    if ored != 0 {
        let (index, status) = statuses.iter().find(|(_, s)| *s != 0).copied().unwrap_or((0, ored));
        return Err(Error::ArgumentMapping { index, status });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_point(total_size: usize) -> EntryPoint {
        EntryPoint {
            name: "k".into(),
            parameter_offsets: vec![],
            total_size,
            uses_dynamic_shared_memory: false,
            kernel_index_type: None,
        }
    }

    #[test]
    fn ptx_marshal_matches_spec_scenario_4() {
        // (i32, View<f32>, i64) with values (7, view{ptr=0xDEADBEEF, len=1024}, -3)
        let params = vec![
            ParameterKind::Primitive { bit_width: 32, signed: true, float: false },
            ParameterKind::View { element_bit_width: 32, pointer_align: 8 },
            ParameterKind::Primitive { bit_width: 64, signed: true, float: false },
        ];
        let args = vec![
            Argument::scalar(7i32),
            Argument::View(View::new(0xDEADBEEF, 1024)),
            Argument::scalar(-3i64),
        ];
        let total = crate::layout::total_size(&params, BackendTag::Ptx).unwrap();
        let ep = entry_point(total);
        let buf = marshal_ptx_buffer(&params, &args, &ep).unwrap();
        assert_eq!(buf.bytes.len(), total);

        let offsets = crate::layout::offsets_of(&params, BackendTag::Ptx).unwrap();
        let read_i32 = i32::from_ne_bytes(buf.bytes[offsets[0]..offsets[0] + 4].try_into().unwrap());
        assert_eq!(read_i32, 7);
        let read_ptr = u64::from_ne_bytes(buf.bytes[offsets[1]..offsets[1] + 8].try_into().unwrap());
        assert_eq!(read_ptr, 0xDEADBEEF);
        let read_len = u64::from_ne_bytes(buf.bytes[offsets[1] + 8..offsets[1] + 16].try_into().unwrap());
        assert_eq!(read_len, 1024);
        let read_i64 = i64::from_ne_bytes(buf.bytes[offsets[2]..offsets[2] + 8].try_into().unwrap());
        assert_eq!(read_i64, -3);
    }

    #[test]
    fn opencl_marshal_matches_spec_scenario_5() {
        let mut ep = entry_point(0);
        ep.kernel_index_type = Some(32);
        let params = vec![ParameterKind::View { element_bit_width: 32, pointer_align: 8 }];
        let args = vec![Argument::View(View::new(0x1000, 8))];
        let calls = marshal_opencl_args(&params, &args, &ep).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[0].size, std::mem::size_of::<u64>());
        assert_eq!(calls[1].index, 1);

        let statuses: Vec<(usize, i64)> = calls.iter().map(|c| (c.index, 0)).collect();
        assert!(check_opencl_statuses(&statuses).is_ok());
    }

    #[test]
    fn opencl_nonzero_status_raises_argument_mapping_error() {
        let err = check_opencl_statuses(&[(0, 0), (1, -30)]).unwrap_err();
        match err {
            Error::ArgumentMapping { index, status } => {
                assert_eq!(index, 1);
                assert_eq!(status, -30);
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn empty_parameter_list_is_valid() {
        let ep = entry_point(0);
        let buf = marshal_ptx_buffer(&[], &[], &ep).unwrap();
        assert!(buf.bytes.is_empty());
        let calls = marshal_opencl_args(&[], &[], &ep).unwrap();
        assert!(calls.is_empty());
    }

    #[test]
    fn null_view_pointer_passes_through_unchanged() {
        let params = vec![ParameterKind::View { element_bit_width: 32, pointer_align: 8 }];
        let args = vec![Argument::View(View::null(4))];
        let total = crate::layout::total_size(&params, BackendTag::Ptx).unwrap();
        let ep = entry_point(total);
        let buf = marshal_ptx_buffer(&params, &args, &ep).unwrap();
        let ptr = u64::from_ne_bytes(buf.bytes[0..8].try_into().unwrap());
        assert_eq!(ptr, 0);
    }
}
