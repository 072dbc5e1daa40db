//! KernelLoader: entry API tying a descriptor + accelerator to a
//! cached/compiled launcher.
//!
//! Grounded on `emu_core`'s `compile.rs` (`compile<I,U,P,C: Cache>`, the
//! hash-then-cache-check-then-compile pipeline, and `SpirvOrFinished`'s
//! `.finish()` inserting into the cache) — generalized from a single
//! global `Cache` + SPIR-V-only emitter to a per-accelerator
//! [`crate::registry::AcceleratorKernelCache`] and a backend-neutral
//! [`CodeEmitter`] collaborator trait.

use crate::accelerator::Accelerator;
use crate::cache::Metadata;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::kernel::{CompiledKernel, KernelBlob, KernelDescriptor};
use crate::launch::{AsyncLaunch, CancellationToken, LaunchConfig};
use crate::mapper::{check_opencl_statuses, marshal_opencl_args, marshal_ptx_buffer, Argument};
use crate::parameter::ParameterKind;
use crate::registry::AcceleratorKernelCache;
use crate::stream::{Job, Stream};
use std::sync::Arc;

/// The out-of-scope external collaborator that actually issues the device
/// launch call (`cuLaunchKernel`/`clEnqueueNDRangeKernel`/an in-process
/// function call). Spec §1 treats driver calls as a black box; this trait
/// is the seam the core's [`Launcher`] enqueues through. Marshalling
/// (`crate::mapper`) always runs before a `Driver` method is invoked — the
/// driver only ever sees already-marshalled call data, never raw arguments.
pub trait Driver: Send + Sync {
    /// PTX-style buffer-mode launch: `(kernel_handle, grid, block,
    /// shared_bytes, stream, arg_buffer_ptr, arg_buffer_size)` per spec §6.
    fn launch_ptx(&self, kernel: &CompiledKernel, config: &LaunchConfig, buffer: &crate::mapper::MarshalledBuffer) -> Result<()>;

    /// OpenCL-style set-arg-mode launch: one `clSetKernelArg` per call,
    /// then `clEnqueueNDRangeKernel`. Returns each call's status so the
    /// caller can OR them per spec §4.2 step 5.
    fn launch_opencl(&self, kernel: &CompiledKernel, config: &LaunchConfig, calls: &[crate::mapper::SetArgCall]) -> Result<Vec<(usize, i64)>>;

    /// CPU in-process call with a synthesized thread index; no byte
    /// marshalling needed since there is no wire format to match.
    fn launch_cpu(&self, kernel: &CompiledKernel, config: &LaunchConfig, args: &[Argument]) -> Result<()>;
}

/// The out-of-scope external collaborator: given a descriptor, produces a
/// `(source_text_or_blob, metadata)` pair. Spec §1 treats the PTX/OpenCL
/// code emitters themselves as black boxes; this trait is the seam the
/// core consumes them through.
pub trait CodeEmitter: Send + Sync {
    fn compile(&self, accelerator: &Accelerator, descriptor: &KernelDescriptor) -> Result<CompiledKernel>;

    /// `"<code_emitter_version>_<target_architecture>_<backend>"` — the
    /// version string cache entries are gated on (spec §4.8).
    fn version_string(&self, accelerator: &Accelerator) -> String;
}

/// A loaded, cache-backed handle to a compiled kernel bound to one
/// accelerator. Cheap to clone; `compiled()` gives read-only introspection
/// access (spec §4.8's `get_kernel`). Also the [`Launcher`] (spec §3): its
/// `launch_*` methods marshal a caller argument tuple via `crate::mapper`
/// and enqueue the result on a [`Stream`].
#[derive(Clone)]
pub struct CachedKernel {
    kernel: Arc<CompiledKernel>,
    cache_key: String,
    parameters: Arc<Vec<ParameterKind>>,
}

impl CachedKernel {
    pub fn compiled(&self) -> &CompiledKernel {
        &self.kernel
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Marshals `args` against this kernel's parameter list and entry
    /// point now (not inside the enqueued job) so mapper errors
    /// (`UnsupportedParameter`, `LayoutMismatch`, `ArgumentMapping`)
    /// surface synchronously — argument marshalling never suspends and is
    /// not itself a driver call (spec §5).
    fn build_job(&self, driver: Arc<dyn Driver>, config: LaunchConfig, args: Vec<Argument>) -> Result<Job> {
        let kernel = self.kernel.clone();
        // Branch on the blob shape rather than the backend tag: it is the
        // blob that determines which wire format the driver expects, and
        // the two always agree for a kernel this loader produced.
        match &kernel.blob {
            KernelBlob::CpuEntryToken(_) => {
                Ok(Box::new(move || driver.launch_cpu(&kernel, &config, &args)))
            }
            KernelBlob::PtxSource(_) => {
                let buffer = marshal_ptx_buffer(&self.parameters, &args, &kernel.entry_point)?;
                Ok(Box::new(move || driver.launch_ptx(&kernel, &config, &buffer)))
            }
            KernelBlob::OpenClSource { .. } => {
                let calls = marshal_opencl_args(&self.parameters, &args, &kernel.entry_point)?;
                Ok(Box::new(move || {
                    let statuses = driver.launch_opencl(&kernel, &config, &calls)?;
                    check_opencl_statuses(&statuses)
                }))
            }
        }
    }

    /// Enqueues the launch on `stream` and blocks until it (and everything
    /// submitted before it) has drained, surfacing a driver error directly.
    #[tracing::instrument(level = "debug", skip(self, driver, stream, args))]
    pub fn launch_sync(&self, driver: Arc<dyn Driver>, stream: &Stream, config: LaunchConfig, args: Vec<Argument>) -> Result<()> {
        let job = self.build_job(driver, config, args)?;
        stream.enqueue(job)?;
        stream.synchronize()
    }

    /// Enqueues the launch and returns an [`AsyncLaunch`] future that
    /// resolves once the stream has drained past it, or `Cancelled` if
    /// `token` is triggered first (spec §4.7) — device work runs to
    /// completion regardless.
    pub fn launch_async(&self, driver: Arc<dyn Driver>, stream: &Stream, config: LaunchConfig, args: Vec<Argument>, token: CancellationToken) -> Result<AsyncLaunch> {
        let job = self.build_job(driver, config, args)?;
        AsyncLaunch::enqueue(stream, job, token)
    }
}

/// Ties a [`CodeEmitter`] to the process-wide [`AcceleratorKernelCache`]
/// registry (or a caller-supplied one, for test isolation).
pub struct KernelLoader<E: CodeEmitter> {
    emitter: E,
    registry: &'static AcceleratorKernelCache,
    cache_config: CacheConfig,
}

impl<E: CodeEmitter> KernelLoader<E> {
    pub fn new(emitter: E) -> Self {
        Self { emitter, registry: crate::registry::global(), cache_config: CacheConfig::default() }
    }

    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Builds the cache key from descriptor + accelerator fingerprint,
    /// looks up the cache, compiles on miss via the emitter, stores the
    /// result, and returns a handle.
    #[tracing::instrument(level = "debug", skip(self, descriptor), fields(kernel_id = %descriptor.identifier))]
    pub fn load_kernel(&self, accelerator: &Accelerator, descriptor: &KernelDescriptor) -> Result<CachedKernel> {
        let cache = self.registry.get_or_create_cache(accelerator, self.cache_config.clone());
        let key = cache_key(accelerator, descriptor);
        let version = self.emitter.version_string(accelerator);

        if let Some(hit) = cache.try_get(&key, &version)? {
            tracing::debug!(key = %key, "kernel cache hit");
            return Ok(CachedKernel { kernel: hit, cache_key: key, parameters: Arc::new(descriptor.parameters.clone()) });
        }

        tracing::info!(key = %key, "kernel cache miss, compiling");
        let compiled = self.emitter.compile(accelerator, descriptor).map_err(|e| {
            tracing::warn!(key = %key, error = %e, "kernel compilation failed");
            e
        })?;
        // Compilation failure above returns before this point: the cache
        // is never populated with a failed entry (spec §4.8).
        cache.put(key.clone(), compiled.clone(), version, Metadata::new())?;
        Ok(CachedKernel { kernel: Arc::new(compiled), cache_key: key, parameters: Arc::new(descriptor.parameters.clone()) })
    }

    /// Same as `load_kernel`, but the entry point is implicitly grouped:
    /// the loader must have reserved the index-extent parameter slot,
    /// which is the emitter's responsibility to reflect in the returned
    /// `EntryPoint.kernel_index_type`; validated here so a misbehaving
    /// emitter fails loudly instead of silently marshalling wrong offsets.
    pub fn load_auto_grouped(&self, accelerator: &Accelerator, descriptor: &KernelDescriptor) -> Result<CachedKernel> {
        if !descriptor.implicitly_grouped {
            return Err(Error::UnsupportedParameter {
                detail: "load_auto_grouped requires an implicitly-grouped descriptor".into(),
            });
        }
        let kernel = self.load_kernel(accelerator, descriptor)?;
        if kernel.compiled().entry_point.kernel_index_type.is_none() {
            return Err(Error::LayoutMismatch {
                expected: 1,
                actual: 0,
            });
        }
        Ok(kernel)
    }

    /// Same as `load_kernel`, but additionally binds the accelerator's
    /// default stream, returning both the kernel and a fresh `Stream` tied
    /// to it.
    pub fn load_stream_kernel(&self, accelerator: &Accelerator, descriptor: &KernelDescriptor) -> Result<(CachedKernel, crate::stream::Stream)> {
        let kernel = self.load_kernel(accelerator, descriptor)?;
        let stream = crate::stream::Stream::new(accelerator.id(), accelerator.backend());
        Ok((kernel, stream))
    }
}

fn cache_key(accelerator: &Accelerator, descriptor: &KernelDescriptor) -> String {
    format!(
        "{}|{}|{}|{:x}|{:x}",
        descriptor.identifier,
        accelerator.backend(),
        accelerator.fingerprint(),
        descriptor.param_type_fingerprint(),
        descriptor.specialization_hash(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{Accelerator, BackendTag};
    use crate::kernel::{EntryPoint, KernelBlob};
    use crate::parameter::ParameterKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmitter {
        compiles: AtomicUsize,
        version: String,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl CodeEmitter for CountingEmitter {
        fn compile(&self, _accelerator: &Accelerator, descriptor: &KernelDescriptor) -> Result<CompiledKernel> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::Compilation { diagnostics: "synthetic failure".into() });
            }
            self.compiles.fetch_add(1, Ordering::SeqCst);
            Ok(CompiledKernel {
                backend: BackendTag::Cpu,
                blob: KernelBlob::CpuEntryToken(descriptor.identifier.clone()),
                entry_point: EntryPoint {
                    name: descriptor.identifier.clone(),
                    parameter_offsets: vec![],
                    total_size: 0,
                    uses_dynamic_shared_memory: false,
                    kernel_index_type: if descriptor.implicitly_grouped { Some(32) } else { None },
                },
                info: None,
                language_version: "native".into(),
            })
        }
        fn version_string(&self, _accelerator: &Accelerator) -> String {
            self.version.clone()
        }
    }

    fn fresh_loader(version: &str) -> KernelLoader<CountingEmitter> {
        KernelLoader {
            emitter: CountingEmitter {
                compiles: AtomicUsize::new(0),
                version: version.into(),
                fail_next: std::sync::atomic::AtomicBool::new(false),
            },
            registry: Box::leak(Box::new(AcceleratorKernelCache::new())),
            cache_config: CacheConfig::default(),
        }
    }

    #[test]
    fn second_load_of_same_descriptor_hits_cache() {
        let loader = fresh_loader("v1");
        let acc = Accelerator::cpu(1);
        let d = KernelDescriptor::new("add", vec![ParameterKind::Primitive { bit_width: 32, signed: true, float: false }]);
        loader.load_kernel(&acc, &d).unwrap();
        loader.load_kernel(&acc, &d).unwrap();
        assert_eq!(loader.emitter.compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn compile_failure_does_not_populate_cache() {
        let loader = fresh_loader("v1");
        loader.emitter.fail_next.store(true, Ordering::SeqCst);
        let acc = Accelerator::cpu(1);
        let d = KernelDescriptor::new("broken", vec![]);
        assert!(loader.load_kernel(&acc, &d).is_err());
        // Retrying after a transient failure recompiles rather than
        // returning a cached failure.
        loader.load_kernel(&acc, &d).unwrap();
        assert_eq!(loader.emitter.compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn load_auto_grouped_requires_grouped_descriptor() {
        let loader = fresh_loader("v1");
        let acc = Accelerator::cpu(1);
        let d = KernelDescriptor::new("k", vec![]);
        assert!(loader.load_auto_grouped(&acc, &d).is_err());
        let grouped = d.grouped();
        assert!(loader.load_auto_grouped(&acc, &grouped).is_ok());
    }

    struct FakeCpuDriver {
        calls: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Driver for FakeCpuDriver {
        fn launch_ptx(&self, _kernel: &CompiledKernel, _config: &LaunchConfig, _buffer: &crate::mapper::MarshalledBuffer) -> Result<()> {
            unreachable!("this test only loads CPU kernels")
        }
        fn launch_opencl(&self, _kernel: &CompiledKernel, _config: &LaunchConfig, _calls: &[crate::mapper::SetArgCall]) -> Result<Vec<(usize, i64)>> {
            unreachable!("this test only loads CPU kernels")
        }
        fn launch_cpu(&self, kernel: &CompiledKernel, _config: &LaunchConfig, _args: &[Argument]) -> Result<()> {
            self.calls.lock().unwrap().push(kernel.entry_point.name.clone());
            Ok(())
        }
    }

    #[test]
    fn launch_sync_marshals_and_enqueues_on_stream() {
        let loader = fresh_loader("v1");
        let acc = Accelerator::cpu(1);
        let d = KernelDescriptor::new("square", vec![ParameterKind::Primitive { bit_width: 32, signed: true, float: false }]);
        let cached = loader.load_kernel(&acc, &d).unwrap();
        let stream = Stream::new(acc.id(), acc.backend());
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let driver: Arc<dyn Driver> = Arc::new(FakeCpuDriver { calls: calls.clone() });

        cached.launch_sync(driver, &stream, LaunchConfig::new((1, 1, 1), (1, 1, 1)), vec![Argument::scalar(7i32)]).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["square".to_string()]);
    }

    #[test]
    fn launch_async_resolves_after_stream_drains() {
        let loader = fresh_loader("v1");
        let acc = Accelerator::cpu(1);
        let d = KernelDescriptor::new("noop", vec![]);
        let cached = loader.load_kernel(&acc, &d).unwrap();
        let stream = Stream::new(acc.id(), acc.backend());
        let driver: Arc<dyn Driver> = Arc::new(FakeCpuDriver { calls: Arc::new(std::sync::Mutex::new(Vec::new())) });

        let fut = cached
            .launch_async(driver, &stream, LaunchConfig::new((1, 1, 1), (1, 1, 1)), vec![], CancellationToken::new())
            .unwrap();
        let outcome = futures::executor::block_on(fut);
        assert!(matches!(outcome, crate::launch::LaunchOutcome::Done(Ok(()))));
    }
}
