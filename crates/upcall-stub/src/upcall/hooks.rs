use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::abi::{METHOD_FROM_COMPILED_OFFSET, WEAK_HANDLE_TAG};
use crate::{Error, Result};

/// Calling convention an external entry point expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAbi {
    Native,
    Runtime,
}

/// A callable code address the stub may branch to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEntry {
    name: String,
    abi: EntryAbi,
    address: u64,
}

impl ExternalEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, abi: EntryAbi, address: u64) -> Self {
        Self {
            name: name.into(),
            abi,
            address,
        }
    }

    #[must_use]
    pub fn native(name: impl Into<String>, address: u64) -> Self {
        Self::new(name, EntryAbi::Native, address)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn abi(&self) -> EntryAbi {
        self.abi
    }

    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }
}

/// Runtime services the stub calls around the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpcallHooks {
    /// `on_entry(frame_data) -> thread`: attach the thread, set up handles.
    pub on_entry: ExternalEntry,
    /// `on_exit(frame_data)`: undo `on_entry`.
    pub on_exit: ExternalEntry,
    /// `handle_uncaught_exception(exception)`: never returns normally.
    pub handle_uncaught_exception: ExternalEntry,
}

impl UpcallHooks {
    pub fn validate(&self) -> Result<()> {
        for hook in [&self.on_entry, &self.on_exit, &self.handle_uncaught_exception] {
            if hook.abi() != EntryAbi::Native {
                return Err(Error::InvalidDescriptor(format!(
                    "hook {} must be callable with the native ABI",
                    hook.name()
                )));
            }
        }
        Ok(())
    }
}

/// The single word the runtime rewrites when a method is (re)compiled.
///
/// Written with release ordering, read with acquire ordering, so a stub that
/// observes a new entry also observes the code it points to.
#[derive(Debug, Default)]
pub struct CalleeTarget(AtomicU64);

impl CalleeTarget {
    #[must_use]
    pub const fn new(entry: u64) -> Self {
        Self(AtomicU64::new(entry))
    }

    #[must_use]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn retarget(&self, entry: u64) {
        self.0.store(entry, Ordering::Release);
    }
}

/// Identity of the managed method a stub calls.
#[derive(Debug, Clone)]
pub struct TargetMethod {
    name: String,
    metadata: u64,
    entry: Arc<CalleeTarget>,
}

impl TargetMethod {
    #[must_use]
    pub fn new(name: impl Into<String>, metadata: u64, entry: Arc<CalleeTarget>) -> Self {
        Self {
            name: name.into(),
            metadata,
            entry,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the method metadata; loaded into the method register.
    #[must_use]
    pub const fn metadata(&self) -> u64 {
        self.metadata
    }

    /// Address of the callee-target cell inside the metadata.
    #[must_use]
    pub const fn callee_target_address(&self) -> u64 {
        self.metadata
            .wrapping_add_signed(METHOD_FROM_COMPILED_OFFSET as i64)
    }

    #[must_use]
    pub fn callee_target(&self) -> &Arc<CalleeTarget> {
        &self.entry
    }
}

impl PartialEq for TargetMethod {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.metadata == other.metadata
            && Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Eq for TargetMethod {}

/// Opaque reference to the receiver object, embedded in the stub as an
/// immediate. Weak handles carry `WEAK_HANDLE_TAG` in their low bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverHandle(u64);

impl ReceiverHandle {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn weak(raw: u64) -> Self {
        Self(raw | WEAK_HANDLE_TAG)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_weak(self) -> bool {
        self.0 & WEAK_HANDLE_TAG != 0
    }

    /// Address of the slot holding the referenced object.
    #[must_use]
    pub const fn slot_address(self) -> u64 {
        self.0 & !WEAK_HANDLE_TAG
    }
}

impl fmt::Display for ReceiverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}{}", self.slot_address(), if self.is_weak() { " (weak)" } else { "" })
    }
}
