//! Double buffer for display textures
//!
//! The render context uploads the next camera frame into the back texture
//! while the front texture is on screen, then the two trade places. Both
//! textures belong to the render context, so no synchronization is needed.

/// Two slots alternating between front and back
#[derive(Debug)]
pub struct DoubleBuffer<T> {
    slots: [T; 2],
    current: usize,
    swaps: u64,
}

impl<T> DoubleBuffer<T> {
    /// Create a double buffer with both slots initialized by `init_fn`
    pub fn new<F>(mut init_fn: F) -> Self
    where
        F: FnMut() -> T,
    {
        Self {
            slots: [init_fn(), init_fn()],
            current: 0,
            swaps: 0,
        }
    }

    /// Slot being prepared for the next present
    pub fn back(&self) -> &T {
        &self.slots[self.current]
    }

    pub fn back_mut(&mut self) -> &mut T {
        &mut self.slots[self.current]
    }

    /// Slot presented last
    pub fn front(&self) -> &T {
        &self.slots[(self.current + 1) & 1]
    }

    /// Exchange front and back after presenting
    pub fn swap(&mut self) {
        self.current = (self.current + 1) & 1;
        self.swaps += 1;
    }

    /// Number of swaps so far
    pub fn swaps(&self) -> u64 {
        self.swaps
    }
}
