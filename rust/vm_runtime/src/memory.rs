//! Per-instance memory context for the Cinder guest VM.
//!
//! The memory model is static and fully bounded at configuration time: a
//! fixed bank of global variable slots and a fixed bank of array slots, each
//! array carrying its own active flag and creation-time size for every
//! subsequent bounds check.  One context is created per engine instance at
//! construction, lives exactly as long as the engine, and is never shared or
//! aliased — this replaces an earlier firmware design where memory operations
//! were indirected through shared function pointers and instances interfered
//! with one another.

use serde::{Deserialize, Serialize};

use crate::exec::ErrorKind;

/// Capacity bounds for one memory context, fixed at engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    /// Number of global variable slots.
    pub globals: usize,
    /// Number of array slots.
    pub array_slots: usize,
    /// Element capacity of each array slot.
    pub array_capacity: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        // Sized for the 32 KB RAM device class.
        Self {
            globals: 32,
            array_slots: 8,
            array_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct ArraySlot {
    values: Vec<i32>,
    active: bool,
    size: usize,
}

impl ArraySlot {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            active: false,
            size: 0,
        }
    }
}

/// Global variable and array storage owned by exactly one engine.
///
/// Reading a global slot that was never written yields zero; written-ness
/// stays observable through [`MemoryContext::global_written`] so forensic
/// capture can tell initialised slots from untouched ones.
#[derive(Debug, Clone)]
pub struct MemoryContext {
    limits: MemoryLimits,
    globals: Vec<i32>,
    written: Vec<bool>,
    live_globals: usize,
    arrays: Vec<ArraySlot>,
}

impl MemoryContext {
    /// Fresh context with every global zeroed and every array slot inactive.
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            limits,
            globals: vec![0; limits.globals],
            written: vec![false; limits.globals],
            live_globals: 0,
            arrays: (0..limits.array_slots)
                .map(|_| ArraySlot::new(limits.array_capacity))
                .collect(),
        }
    }

    /// Bounds this context was created with.
    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }

    /// Value of global slot `id`.
    pub fn load_global(&self, id: usize) -> Result<i32, ErrorKind> {
        self.globals
            .get(id)
            .copied()
            .ok_or(ErrorKind::InvalidMemoryAccess)
    }

    /// Store `value` into global slot `id`.
    pub fn store_global(&mut self, id: usize, value: i32) -> Result<(), ErrorKind> {
        let slot = self
            .globals
            .get_mut(id)
            .ok_or(ErrorKind::InvalidMemoryAccess)?;
        *slot = value;
        if !self.written[id] {
            self.written[id] = true;
            self.live_globals += 1;
        }
        Ok(())
    }

    /// Whether global slot `id` has ever been written.
    pub fn global_written(&self, id: usize) -> bool {
        self.written.get(id).copied().unwrap_or(false)
    }

    /// Count of global slots written at least once.
    pub fn live_globals(&self) -> usize {
        self.live_globals
    }

    /// Activate array slot `id` with `size` elements, zeroing its storage.
    ///
    /// Creating over an already-active slot silently overwrites it; the size
    /// is fixed for the remainder of the slot's lifetime.
    pub fn create_array(&mut self, id: usize, size: usize) -> Result<(), ErrorKind> {
        if size > self.limits.array_capacity {
            return Err(ErrorKind::InvalidMemoryAccess);
        }
        let slot = self
            .arrays
            .get_mut(id)
            .ok_or(ErrorKind::InvalidMemoryAccess)?;
        slot.values.fill(0);
        slot.active = true;
        slot.size = size;
        Ok(())
    }

    /// Element `index` of array slot `id`.
    pub fn array_load(&self, id: usize, index: usize) -> Result<i32, ErrorKind> {
        let slot = self.arrays.get(id).ok_or(ErrorKind::InvalidMemoryAccess)?;
        if !slot.active || index >= slot.size {
            return Err(ErrorKind::InvalidMemoryAccess);
        }
        Ok(slot.values[index])
    }

    /// Store `value` into element `index` of array slot `id`.
    pub fn array_store(&mut self, id: usize, index: usize, value: i32) -> Result<(), ErrorKind> {
        let slot = self
            .arrays
            .get_mut(id)
            .ok_or(ErrorKind::InvalidMemoryAccess)?;
        if !slot.active || index >= slot.size {
            return Err(ErrorKind::InvalidMemoryAccess);
        }
        slot.values[index] = value;
        Ok(())
    }

    /// Whether array slot `id` has been created.
    pub fn array_active(&self, id: usize) -> bool {
        self.arrays.get(id).map(|slot| slot.active).unwrap_or(false)
    }

    /// Size recorded when array slot `id` was created, if active.
    pub fn array_size(&self, id: usize) -> Option<usize> {
        self.arrays
            .get(id)
            .filter(|slot| slot.active)
            .map(|slot| slot.size)
    }

    /// Live elements of array slot `id`, if active.  Forensic inspection only.
    pub fn array_contents(&self, id: usize) -> Option<&[i32]> {
        self.arrays
            .get(id)
            .filter(|slot| slot.active)
            .map(|slot| &slot.values[..slot.size])
    }
}
