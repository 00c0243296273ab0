//! Host CPU device runtime
//!
//! Implements [`DeviceRuntime`] in-process: the "device" is the host CPU,
//! SVM allocations are aligned heap blocks and the atomic kernel runs on
//! OS threads. Device profiles are configurable, including faults, so the
//! same backend serves tests and machines without a compute driver.

use crate::caps::{RegionFlags, SvmCapabilities};
use crate::runtime::{
    AccessMode, DeviceId, DeviceInfo, DeviceRuntime, DeviceType, NativeContext, NativeError,
    NativeQueue, NativeResult, PlatformId, PlatformInfo, SvmAddr,
};
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Barrier;

/// Native status codes returned by the host runtime
pub mod status {
    pub const DEVICE_NOT_FOUND: i32 = -1;
    pub const DEVICE_NOT_AVAILABLE: i32 = -2;
    pub const MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
    pub const OUT_OF_HOST_MEMORY: i32 = -6;
    pub const INVALID_VALUE: i32 = -30;
    pub const INVALID_PLATFORM: i32 = -32;
    pub const INVALID_DEVICE: i32 = -33;
    pub const INVALID_CONTEXT: i32 = -34;
    pub const INVALID_COMMAND_QUEUE: i32 = -36;
    pub const INVALID_OPERATION: i32 = -59;
}

/// Default number of worker threads for the atomic kernel
const DEFAULT_WORKERS: usize = 4;

/// Faults a host device can be told to exhibit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFaults {
    /// `create_context` fails with `DEVICE_NOT_AVAILABLE`
    pub reject_context: bool,
    /// `svm_alloc` fails as if the driver returned null
    pub fail_alloc: bool,
    /// Atomic kernel loses updates while the device still advertises ATOMICS
    pub lossy_atomics: bool,
    /// `capability_bits` fails with this status
    pub capability_query_status: Option<i32>,
}

/// Profile of one simulated device
#[derive(Debug, Clone)]
pub struct HostDevice {
    pub name: Vec<u8>,
    pub device_type: DeviceType,
    pub global_mem_size: u64,
    pub version: String,
    pub extensions: String,
    pub capabilities: SvmCapabilities,
    pub base_addr_align_bits: u32,
    pub max_alloc_size: u64,
    pub faults: DeviceFaults,
}

impl HostDevice {
    /// Fully capable host CPU device
    pub fn cpu(name: &str) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            device_type: DeviceType::Cpu,
            global_mem_size: 4 << 30,
            version: "OpenCL 3.0 svmem-host".to_string(),
            extensions: "cl_khr_global_int32_base_atomics cl_khr_global_int32_extended_atomics \
                         cl_khr_int64_base_atomics"
                .to_string(),
            capabilities: SvmCapabilities::from_bits_truncate(0xF),
            base_addr_align_bits: 1024,
            max_alloc_size: 1 << 30,
            faults: DeviceFaults::default(),
        }
    }

    /// GPU-typed device with the given capability bits
    pub fn gpu(name: &str, capabilities: SvmCapabilities) -> Self {
        Self {
            device_type: DeviceType::Gpu,
            capabilities,
            ..Self::cpu(name)
        }
    }

    pub fn with_capabilities(mut self, capabilities: SvmCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_extensions(mut self, extensions: &str) -> Self {
        self.extensions = extensions.to_string();
        self
    }

    pub fn with_raw_name(mut self, name: &[u8]) -> Self {
        self.name = name.to_vec();
        self
    }

    pub fn with_max_alloc_size(mut self, size: u64) -> Self {
        self.max_alloc_size = size;
        self
    }

    pub fn with_faults(mut self, faults: DeviceFaults) -> Self {
        self.faults = faults;
        self
    }
}

/// Profile of one simulated platform
#[derive(Debug, Clone)]
pub struct HostPlatform {
    pub name: Vec<u8>,
    pub vendor: Vec<u8>,
    pub version: String,
    pub devices: Vec<HostDevice>,
    /// Status returned by device enumeration instead of the device list
    pub device_query_status: Option<i32>,
}

impl HostPlatform {
    pub fn new(name: &str, vendor: &str) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            vendor: vendor.as_bytes().to_vec(),
            version: "OpenCL 3.0".to_string(),
            devices: Vec::new(),
            device_query_status: None,
        }
    }

    pub fn with_device(mut self, device: HostDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Make device enumeration on this platform fail with `status`
    pub fn with_device_query_status(mut self, status: i32) -> Self {
        self.device_query_status = Some(status);
        self
    }
}

/// Snapshot of per-call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub capability_bits: usize,
    pub create_context: usize,
    pub release_context: usize,
    pub create_queue: usize,
    pub release_queue: usize,
    pub svm_alloc: usize,
    pub svm_free: usize,
    pub svm_map: usize,
    pub svm_unmap: usize,
    pub atomic_increment: usize,
}

#[derive(Default)]
struct Counters {
    capability_bits: AtomicUsize,
    create_context: AtomicUsize,
    release_context: AtomicUsize,
    create_queue: AtomicUsize,
    release_queue: AtomicUsize,
    svm_alloc: AtomicUsize,
    svm_free: AtomicUsize,
    svm_map: AtomicUsize,
    svm_unmap: AtomicUsize,
    atomic_increment: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

struct Allocation {
    layout: Layout,
    context: u64,
}

#[derive(Default)]
struct HostState {
    next_handle: u64,
    /// context -> (platform index, device index)
    contexts: HashMap<u64, (usize, usize)>,
    /// queue -> context
    queues: HashMap<u64, u64>,
    allocations: HashMap<u64, Allocation>,
    mapped: HashSet<u64>,
}

impl HostState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// In-process device runtime backed by host memory
pub struct HostRuntime {
    platforms: Vec<HostPlatform>,
    workers: usize,
    state: Mutex<HostState>,
    counters: Counters,
}

impl HostRuntime {
    /// Runtime exposing the given platforms
    pub fn new(platforms: Vec<HostPlatform>) -> Self {
        Self {
            platforms,
            workers: DEFAULT_WORKERS,
            state: Mutex::new(HostState::default()),
            counters: Counters::default(),
        }
    }

    /// One platform with one fully capable CPU device
    pub fn cpu() -> Self {
        Self::new(vec![
            HostPlatform::new("svmem host", "svmem").with_device(HostDevice::cpu("Host CPU"))
        ])
    }

    /// Set the number of threads running the atomic kernel
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Native calls issued so far
    pub fn calls(&self) -> CallCounts {
        let c = &self.counters;
        let load = |a: &AtomicUsize| a.load(Ordering::SeqCst);
        CallCounts {
            capability_bits: load(&c.capability_bits),
            create_context: load(&c.create_context),
            release_context: load(&c.release_context),
            create_queue: load(&c.create_queue),
            release_queue: load(&c.release_queue),
            svm_alloc: load(&c.svm_alloc),
            svm_free: load(&c.svm_free),
            svm_map: load(&c.svm_map),
            svm_unmap: load(&c.svm_unmap),
            atomic_increment: load(&c.atomic_increment),
        }
    }

    /// Number of allocations not yet freed
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of currently mapped allocations
    pub fn mapped_allocations(&self) -> usize {
        self.state.lock().mapped.len()
    }

    fn platform_id(index: usize) -> PlatformId {
        PlatformId(((index as u64) + 1) << 32)
    }

    fn device_id(platform: usize, device: usize) -> DeviceId {
        DeviceId((((platform as u64) + 1) << 32) | ((device as u64) + 1))
    }

    fn platform_index(&self, id: PlatformId) -> NativeResult<usize> {
        let index = (id.0 >> 32) as usize;
        if id.0 & 0xFFFF_FFFF != 0 || index == 0 || index > self.platforms.len() {
            return Err(NativeError::new("platform", status::INVALID_PLATFORM));
        }
        Ok(index - 1)
    }

    fn device_index(&self, id: DeviceId) -> NativeResult<(usize, usize)> {
        let platform = (id.0 >> 32) as usize;
        let device = (id.0 & 0xFFFF_FFFF) as usize;
        if platform == 0 || device == 0 {
            return Err(NativeError::new("device", status::INVALID_DEVICE));
        }
        let devices = self
            .platforms
            .get(platform - 1)
            .map(|p| p.devices.len())
            .unwrap_or(0);
        if device > devices {
            return Err(NativeError::new("device", status::INVALID_DEVICE));
        }
        Ok((platform - 1, device - 1))
    }

    fn device(&self, index: (usize, usize)) -> &HostDevice {
        &self.platforms[index.0].devices[index.1]
    }

    fn queue_device(&self, queue: NativeQueue, call: &'static str) -> NativeResult<&HostDevice> {
        let state = self.state.lock();
        let context = state
            .queues
            .get(&queue.0)
            .ok_or(NativeError::new(call, status::INVALID_COMMAND_QUEUE))?;
        let index = state
            .contexts
            .get(context)
            .copied()
            .ok_or(NativeError::new(call, status::INVALID_CONTEXT))?;
        Ok(self.device(index))
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::cpu()
    }
}

impl DeviceRuntime for HostRuntime {
    fn enumerate_platforms(&self) -> NativeResult<Vec<PlatformInfo>> {
        Ok(self
            .platforms
            .iter()
            .enumerate()
            .map(|(i, p)| PlatformInfo {
                id: Self::platform_id(i),
                name: p.name.clone(),
                vendor: p.vendor.clone(),
                version: p.version.clone(),
            })
            .collect())
    }

    fn enumerate_devices(&self, platform: PlatformId) -> NativeResult<Vec<DeviceInfo>> {
        let p = self.platform_index(platform)?;
        if let Some(code) = self.platforms[p].device_query_status {
            return Err(NativeError::new("enumerate_devices", code));
        }
        Ok(self.platforms[p]
            .devices
            .iter()
            .enumerate()
            .map(|(d, dev)| DeviceInfo {
                id: Self::device_id(p, d),
                name: dev.name.clone(),
                device_type: dev.device_type.as_raw(),
                global_mem_size: dev.global_mem_size,
                version: dev.version.clone(),
                extensions: dev.extensions.clone(),
                base_addr_align_bits: dev.base_addr_align_bits,
                max_alloc_size: dev.max_alloc_size,
            })
            .collect())
    }

    fn capability_bits(&self, device: DeviceId) -> NativeResult<u64> {
        bump(&self.counters.capability_bits);
        let dev = self.device(self.device_index(device)?);
        if let Some(status) = dev.faults.capability_query_status {
            return Err(NativeError::new("capability_bits", status));
        }
        Ok(dev.capabilities.bits())
    }

    fn create_context(
        &self,
        platform: PlatformId,
        device: DeviceId,
    ) -> NativeResult<NativeContext> {
        bump(&self.counters.create_context);
        let p = self.platform_index(platform)?;
        let index = self.device_index(device)?;
        if index.0 != p {
            return Err(NativeError::new("create_context", status::INVALID_DEVICE));
        }
        if self.device(index).faults.reject_context {
            return Err(NativeError::new("create_context", status::DEVICE_NOT_AVAILABLE));
        }
        let mut state = self.state.lock();
        let handle = state.handle();
        state.contexts.insert(handle, index);
        Ok(NativeContext(handle))
    }

    fn release_context(&self, context: NativeContext) -> NativeResult<()> {
        bump(&self.counters.release_context);
        let mut state = self.state.lock();
        state
            .contexts
            .remove(&context.0)
            .map(|_| ())
            .ok_or(NativeError::new("release_context", status::INVALID_CONTEXT))
    }

    fn create_queue(&self, context: NativeContext, device: DeviceId) -> NativeResult<NativeQueue> {
        bump(&self.counters.create_queue);
        let index = self.device_index(device)?;
        let mut state = self.state.lock();
        match state.contexts.get(&context.0) {
            Some(owner) if *owner == index => {}
            Some(_) => return Err(NativeError::new("create_queue", status::INVALID_DEVICE)),
            None => return Err(NativeError::new("create_queue", status::INVALID_CONTEXT)),
        }
        let handle = state.handle();
        state.queues.insert(handle, context.0);
        Ok(NativeQueue(handle))
    }

    fn release_queue(&self, queue: NativeQueue) -> NativeResult<()> {
        bump(&self.counters.release_queue);
        let mut state = self.state.lock();
        state
            .queues
            .remove(&queue.0)
            .map(|_| ())
            .ok_or(NativeError::new("release_queue", status::INVALID_COMMAND_QUEUE))
    }

    fn svm_alloc(
        &self,
        context: NativeContext,
        size: usize,
        alignment: usize,
        flags: RegionFlags,
    ) -> NativeResult<SvmAddr> {
        bump(&self.counters.svm_alloc);
        let mut state = self.state.lock();
        let index = state
            .contexts
            .get(&context.0)
            .copied()
            .ok_or(NativeError::new("svm_alloc", status::INVALID_CONTEXT))?;
        let dev = self.device(index);
        if dev.faults.fail_alloc {
            return Err(NativeError::new("svm_alloc", status::MEM_OBJECT_ALLOCATION_FAILURE));
        }
        if flags.contains(RegionFlags::ATOMIC)
            && !dev.capabilities.contains(SvmCapabilities::ATOMICS)
        {
            return Err(NativeError::new("svm_alloc", status::INVALID_VALUE));
        }
        let layout = Layout::from_size_align(size.max(1), alignment.max(1))
            .map_err(|_| NativeError::new("svm_alloc", status::INVALID_VALUE))?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(NativeError::new("svm_alloc", status::OUT_OF_HOST_MEMORY));
        }
        let addr = ptr as u64;
        state.allocations.insert(
            addr,
            Allocation {
                layout,
                context: context.0,
            },
        );
        Ok(SvmAddr(addr))
    }

    fn svm_free(&self, context: NativeContext, addr: SvmAddr) -> NativeResult<()> {
        bump(&self.counters.svm_free);
        let mut state = self.state.lock();
        match state.allocations.get(&addr.0) {
            Some(a) if a.context == context.0 => {}
            Some(_) => return Err(NativeError::new("svm_free", status::INVALID_CONTEXT)),
            None => return Err(NativeError::new("svm_free", status::INVALID_VALUE)),
        }
        if let Some(alloc) = state.allocations.remove(&addr.0) {
            state.mapped.remove(&addr.0);
            // SAFETY: addr was returned by alloc_zeroed with this layout
            unsafe { std::alloc::dealloc(addr.0 as *mut u8, alloc.layout) };
        }
        Ok(())
    }

    fn svm_map(
        &self,
        queue: NativeQueue,
        addr: SvmAddr,
        size: usize,
        _access: AccessMode,
    ) -> NativeResult<SvmAddr> {
        bump(&self.counters.svm_map);
        let mut state = self.state.lock();
        if !state.queues.contains_key(&queue.0) {
            return Err(NativeError::new("svm_map", status::INVALID_COMMAND_QUEUE));
        }
        let alloc = state
            .allocations
            .get(&addr.0)
            .ok_or(NativeError::new("svm_map", status::INVALID_VALUE))?;
        if size > alloc.layout.size() {
            return Err(NativeError::new("svm_map", status::INVALID_VALUE));
        }
        if !state.mapped.insert(addr.0) {
            return Err(NativeError::new("svm_map", status::INVALID_OPERATION));
        }
        Ok(addr)
    }

    fn svm_unmap(&self, queue: NativeQueue, addr: SvmAddr) -> NativeResult<()> {
        bump(&self.counters.svm_unmap);
        let mut state = self.state.lock();
        if !state.queues.contains_key(&queue.0) {
            return Err(NativeError::new("svm_unmap", status::INVALID_COMMAND_QUEUE));
        }
        if !state.mapped.remove(&addr.0) {
            return Err(NativeError::new("svm_unmap", status::INVALID_OPERATION));
        }
        Ok(())
    }

    fn atomic_increment(
        &self,
        queue: NativeQueue,
        addr: SvmAddr,
        work_items: usize,
    ) -> NativeResult<()> {
        bump(&self.counters.atomic_increment);
        let lossy = self.queue_device(queue, "atomic_increment")?.faults.lossy_atomics;
        {
            let state = self.state.lock();
            let alloc = state
                .allocations
                .get(&addr.0)
                .ok_or(NativeError::new("atomic_increment", status::INVALID_VALUE))?;
            if alloc.layout.size() < 4 || addr.0 % 4 != 0 {
                return Err(NativeError::new("atomic_increment", status::INVALID_VALUE));
            }
        }
        if work_items == 0 {
            return Ok(());
        }

        // SAFETY: addr is a live, 4-byte aligned allocation of at least 4 bytes
        let counter = unsafe { &*(addr.0 as *const AtomicU32) };
        let workers = self.workers.min(work_items);
        let chunk = work_items / workers;
        let remainder = work_items % workers;
        let barrier = Barrier::new(workers);

        std::thread::scope(|s| {
            for w in 0..workers {
                let n = chunk + usize::from(w < remainder);
                let barrier = &barrier;
                s.spawn(move || {
                    if lossy {
                        // every worker reads before anyone writes: updates are lost
                        let seen = counter.load(Ordering::Relaxed);
                        barrier.wait();
                        counter.store(seen.wrapping_add(n as u32), Ordering::Relaxed);
                    } else {
                        for _ in 0..n {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        Ok(())
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (addr, alloc) in state.allocations.drain() {
            // SAFETY: every entry was produced by alloc_zeroed with its layout
            unsafe { std::alloc::dealloc(addr as *mut u8, alloc.layout) };
        }
    }
}
