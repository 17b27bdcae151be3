//! Opaque, signature-tagged handles backed by a generational arena.
//!
//! A handle names a slot and the generation it was issued for. Releasing a
//! slot bumps its generation, so a stale handle can never alias the next
//! occupant. Each live slot also carries the signature it was allocated with;
//! validating with any other signature fails exactly like a stale handle.

use crate::error::{Result, UsbdError};
use std::fmt;

/// Caller-chosen tag stored with every live handle.
pub type Signature = u32;

/// Raw opaque handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Pack into a single word, e.g. for logging or FFI tokens.
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Rebuild from a packed word. The result still has to pass validation.
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.to_raw())
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<(Signature, T)>,
}

/// Fixed-capacity pool of signature-checked handles, each owning a payload.
pub struct HandleRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl<T> HandleRegistry<T> {
    /// Create a registry that hands out at most `capacity` live handles.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    /// Allocate a handle tagged with `signature` for `payload`.
    pub fn allocate(&mut self, signature: Signature, payload: T) -> Result<Handle> {
        if self.live >= self.capacity {
            return Err(UsbdError::OutOfResources("handles"));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| UsbdError::OutOfResources("handles"))?;
                self.slots.push(Slot {
                    generation: 1,
                    entry: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Some((signature, payload));
        self.live += 1;

        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Return the payload for a live handle carrying `signature`.
    pub fn validate(&self, handle: Handle, signature: Signature) -> Result<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Slot {
                generation,
                entry: Some((sig, payload)),
            }) if *generation == handle.generation && *sig == signature => Ok(payload),
            _ => Err(UsbdError::BadHandle),
        }
    }

    /// Mutable variant of [`validate`](Self::validate).
    pub fn validate_mut(&mut self, handle: Handle, signature: Signature) -> Result<&mut T> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot {
                generation,
                entry: Some((sig, payload)),
            }) if *generation == handle.generation && *sig == signature => Ok(payload),
            _ => Err(UsbdError::BadHandle),
        }
    }

    /// Release a handle, returning its payload. The slot's generation moves on.
    pub fn release(&mut self, handle: Handle, signature: Signature) -> Result<T> {
        self.validate(handle, signature)?;

        let slot = &mut self.slots[handle.index as usize];
        let (_, payload) = slot.entry.take().ok_or(UsbdError::BadHandle)?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        self.live -= 1;

        Ok(payload)
    }

    /// Iterate over live handles carrying `signature`.
    pub fn iter(&self, signature: Signature) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(move |(index, slot)| {
            match &slot.entry {
                Some((sig, payload)) if *sig == signature => Some((
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    payload,
                )),
                _ => None,
            }
        })
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Registered client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(pub(crate) Handle);

/// Attached host controller driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HcdHandle(pub(crate) Handle);

/// A hub or device on some bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) Handle);

/// A client's channel to one endpoint of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeHandle(pub(crate) Handle);

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

impl fmt::Display for HcdHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hcd {}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.0)
    }
}

impl fmt::Display for PipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe {}", self.0)
    }
}
