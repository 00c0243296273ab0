//! Scoped host access to regions

use crate::context::SvmContext;
use crate::registry::Region;
use crate::runtime::{AccessMode, SvmAddr};
use crate::{Error, Result};
use tracing::{debug, warn};

/// RAII host mapping of one region.
///
/// Coarse-grained regions are mapped through the runtime on creation and
/// unmapped on drop. Fine-grained regions are coherent, so the guard hands
/// out the allocation address directly and never calls the runtime.
pub struct MappedRegion<'a> {
    context: &'a SvmContext,
    region: Region,
    addr: SvmAddr,
    host: *mut u8,
    len: usize,
    access: AccessMode,
    /// Native map is outstanding
    native: bool,
    released: bool,
}

impl<'a> MappedRegion<'a> {
    /// Get mapped region
    pub fn region(&self) -> Region {
        self.region
    }

    /// Get access mode
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Usable length in bytes, as requested at allocation
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region has no usable bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when no runtime map was needed
    pub fn is_passthrough(&self) -> bool {
        !self.native
    }

    /// Host view (not available through a write-only mapping)
    pub fn as_slice(&self) -> Result<&[u8]> {
        if !self.access.can_read() {
            return Err(Error::InvalidArgument(format!(
                "region {} is mapped write-only",
                self.region
            )));
        }
        // SAFETY: host points at a live allocation of at least len bytes;
        // the context is borrowed, so the region cannot be freed meanwhile
        Ok(unsafe { std::slice::from_raw_parts(self.host, self.len) })
    }

    /// Mutable host view (requires write access)
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if !self.access.can_write() {
            return Err(Error::ReadOnly);
        }
        // SAFETY: as above; the context refuses a second mapping of the same
        // region, so this is the only view
        Ok(unsafe { std::slice::from_raw_parts_mut(self.host, self.len) })
    }

    /// Unmap now, surfacing any runtime error
    pub fn unmap(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.context.release_mapping(self.region);
        if self.native {
            self.context
                .runtime()
                .svm_unmap(self.context.queue(), self.addr)?;
            debug!(region = %self.region, addr = %self.addr, "region unmapped");
        }
        Ok(())
    }
}

impl Drop for MappedRegion<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(region = %self.region, error = %e, "unmap failed");
        }
    }
}

impl SvmContext {
    /// Map a region for host access.
    ///
    /// Blocks until the runtime has completed the map. A region can be
    /// mapped at most once at a time.
    pub fn map(&self, region: Region, access: AccessMode) -> Result<MappedRegion<'_>> {
        self.ensure_live()?;
        let info = *self.lookup(region)?;
        if !self.claim_mapping(region) {
            return Err(Error::InvalidArgument(format!(
                "region {} is already mapped",
                region
            )));
        }

        let native = info.flags.granularity().requires_map();
        let host = if native {
            match self
                .runtime()
                .svm_map(self.queue(), info.addr, info.size, access)
            {
                Ok(host) => host,
                Err(e) => {
                    self.release_mapping(region);
                    return Err(e.into());
                }
            }
        } else {
            info.addr
        };
        debug!(region = %region, addr = %info.addr, ?access, native, "region mapped");

        Ok(MappedRegion {
            context: self,
            region,
            addr: info.addr,
            host: host.0 as *mut u8,
            len: info.requested_size,
            access,
            native,
            released: false,
        })
    }

    /// Run `f` with the region mapped; it is unmapped on every exit path.
    ///
    /// If both `f` and the unmap fail, the error from `f` is returned.
    pub fn with_mapped<R, F>(&self, region: Region, access: AccessMode, f: F) -> Result<R>
    where
        F: FnOnce(&mut MappedRegion<'_>) -> Result<R>,
    {
        let mut mapping = self.map(region, access)?;
        let result = f(&mut mapping);
        let unmapped = mapping.unmap();
        let value = result?;
        unmapped?;
        Ok(value)
    }
}
