use std::fmt;

use crate::abi::{ConventionDescriptor, DEOPT_SPILL_SIZE, FRAME_DATA_SIZE, STACK_SLOT_SIZE};

/// Named regions of an upcall stub frame, lowest address first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrameRegion {
    /// Outgoing stack arguments for the target; at least the native shadow space.
    OutArgs,
    /// One word the runtime may use across a deoptimization.
    DeoptSpill,
    /// Native return registers during `on_exit`.
    ResultSave,
    /// Native argument registers during `on_entry`.
    ArgSave,
    /// Native non-volatile registers.
    CalleeSave,
    FrameData,
    ReturnBuffer,
}

impl fmt::Display for FrameRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutArgs => "out_args",
            Self::DeoptSpill => "deopt_spill",
            Self::ResultSave => "result_save",
            Self::ArgSave => "arg_save",
            Self::CalleeSave => "callee_save",
            Self::FrameData => "frame_data",
            Self::ReturnBuffer => "return_buffer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSpan {
    pub region: FrameRegion,
    /// Byte offset from the stack pointer after the prologue.
    pub offset: usize,
    pub size: usize,
}

impl RegionSpan {
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Final frame layout. Regions are contiguous, in `FrameRegion` order, and
/// the total is a multiple of the stack alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    regions: Vec<RegionSpan>,
    frame_size: usize,
    alignment: usize,
}

impl FrameLayout {
    #[must_use]
    pub fn regions(&self) -> &[RegionSpan] {
        &self.regions
    }

    #[must_use]
    pub fn region(&self, region: FrameRegion) -> Option<RegionSpan> {
        self.regions.iter().copied().find(|span| span.region == region)
    }

    /// Offset of a region that is always present.
    #[must_use]
    pub fn offset(&self, region: FrameRegion) -> usize {
        self.region(region).map_or(0, |span| span.offset)
    }

    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.frame_size
    }

    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.alignment
    }
}

impl fmt::Display for FrameLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "frame {} bytes (align {})", self.frame_size, self.alignment)?;
        for span in &self.regions {
            writeln!(f, "  [{:4}..{:4}) {}", span.offset, span.end(), span.region)?;
        }
        Ok(())
    }
}

/// Accumulates frame regions in their fixed order.
#[derive(Debug, Clone)]
pub struct FrameLayoutPlanner {
    out_arg_stack_slots: usize,
    shadow_space_bytes: usize,
    alignment: usize,
    result_spill_bytes: usize,
    arg_spill_bytes: usize,
    callee_save_bytes: usize,
    return_buffer_bytes: Option<usize>,
}

impl FrameLayoutPlanner {
    /// Stack rules come from the native descriptor: the stub calls its hooks
    /// with the native ABI.
    #[must_use]
    pub fn new(native: &ConventionDescriptor) -> Self {
        Self {
            out_arg_stack_slots: 0,
            shadow_space_bytes: native.shadow_space_bytes(),
            alignment: native.stack_alignment_bytes(),
            result_spill_bytes: 0,
            arg_spill_bytes: 0,
            callee_save_bytes: 0,
            return_buffer_bytes: None,
        }
    }

    #[must_use]
    pub const fn out_arg_stack_slots(mut self, slots: usize) -> Self {
        self.out_arg_stack_slots = slots;
        self
    }

    #[must_use]
    pub const fn result_spill_bytes(mut self, bytes: usize) -> Self {
        self.result_spill_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn arg_spill_bytes(mut self, bytes: usize) -> Self {
        self.arg_spill_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn callee_save_bytes(mut self, bytes: usize) -> Self {
        self.callee_save_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn return_buffer(mut self, bytes: Option<usize>) -> Self {
        self.return_buffer_bytes = bytes;
        self
    }

    #[must_use]
    pub fn plan(&self) -> FrameLayout {
        let out_args = align_up(self.out_arg_stack_slots * STACK_SLOT_SIZE, self.alignment)
            .max(self.shadow_space_bytes);

        let mut sizes = vec![
            (FrameRegion::OutArgs, out_args),
            (FrameRegion::DeoptSpill, DEOPT_SPILL_SIZE),
            (FrameRegion::ResultSave, self.result_spill_bytes),
            (FrameRegion::ArgSave, self.arg_spill_bytes),
            (FrameRegion::CalleeSave, self.callee_save_bytes),
            (FrameRegion::FrameData, FRAME_DATA_SIZE),
        ];
        if let Some(bytes) = self.return_buffer_bytes {
            sizes.push((FrameRegion::ReturnBuffer, bytes));
        }

        let mut offset = 0;
        let regions: Vec<_> = sizes
            .into_iter()
            .map(|(region, size)| {
                let span = RegionSpan {
                    region,
                    offset,
                    size,
                };
                offset += size;
                span
            })
            .collect();
        let frame_size = align_up(offset, self.alignment);

        tracing::debug!(
            frame_size,
            out_args,
            callee_save = self.callee_save_bytes,
            return_buffer = ?self.return_buffer_bytes,
            "planned upcall frame"
        );

        FrameLayout {
            regions,
            frame_size,
            alignment: self.alignment,
        }
    }
}

#[must_use]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}
