use std::collections::HashMap;
use std::sync::Mutex;

/// A sparse byte-addressed simulation of VE physical memory, standing in
/// for the real VE page tables / onboard memory this crate cannot reach.
/// Uninitialized bytes read as zero, matching the round-trip law's
/// "VE memory was uninitialized or zero beforehand" precondition.
pub struct VeMemoryImage {
    bytes: Mutex<HashMap<u64, u8>>,
}

impl VeMemoryImage {
    pub fn new() -> Self {
        Self { bytes: Mutex::new(HashMap::new()) }
    }

    pub fn write(&self, addr: u64, data: &[u8]) {
        let mut g = self.bytes.lock().unwrap();
        for (i, b) in data.iter().enumerate() {
            g.insert(addr + i as u64, *b);
        }
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let g = self.bytes.lock().unwrap();
        (0..len as u64).map(|i| *g.get(&(addr + i)).unwrap_or(&0)).collect()
    }

    /// Preloads a range to a constant byte, used by tests that exercise
    /// the read-modify-write bounce path against non-zero neighbors.
    pub fn fill(&self, addr: u64, len: usize, value: u8) {
        self.write(addr, &vec![value; len]);
    }
}

impl Default for VeMemoryImage {
    fn default() -> Self {
        Self::new()
    }
}
