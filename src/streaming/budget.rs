//! Memory budget tracking for streaming
//!
//! Tracks main-memory staging and GPU texture usage in bytes. Pressure
//! metrics guide eviction and whether a brick can be admitted.

/// Byte budgets for CPU staging and GPU textures
#[derive(Clone, Debug)]
pub struct MemoryBudget {
    cpu_budget_bytes: u64,
    gpu_budget_bytes: u64,
    cpu_used_bytes: u64,
    gpu_used_bytes: u64,
}

impl MemoryBudget {
    pub fn new(cpu_budget_bytes: u64, gpu_budget_bytes: u64) -> Self {
        Self {
            cpu_budget_bytes,
            gpu_budget_bytes,
            cpu_used_bytes: 0,
            gpu_used_bytes: 0,
        }
    }

    // --- Tracking ---

    pub fn add_cpu(&mut self, bytes: u64) {
        self.cpu_used_bytes = self.cpu_used_bytes.saturating_add(bytes);
    }

    pub fn add_gpu(&mut self, bytes: u64) {
        self.gpu_used_bytes = self.gpu_used_bytes.saturating_add(bytes);
    }

    pub fn remove_cpu(&mut self, bytes: u64) {
        self.cpu_used_bytes = self.cpu_used_bytes.saturating_sub(bytes);
    }

    pub fn remove_gpu(&mut self, bytes: u64) {
        self.gpu_used_bytes = self.gpu_used_bytes.saturating_sub(bytes);
    }

    pub fn reset_gpu(&mut self) {
        self.gpu_used_bytes = 0;
    }

    // --- Queries ---

    pub fn cpu_used(&self) -> u64 {
        self.cpu_used_bytes
    }

    pub fn gpu_used(&self) -> u64 {
        self.gpu_used_bytes
    }

    pub fn cpu_limit(&self) -> u64 {
        self.cpu_budget_bytes
    }

    pub fn gpu_limit(&self) -> u64 {
        self.gpu_budget_bytes
    }

    pub fn cpu_available(&self) -> u64 {
        self.cpu_budget_bytes.saturating_sub(self.cpu_used_bytes)
    }

    pub fn gpu_available(&self) -> u64 {
        self.gpu_budget_bytes.saturating_sub(self.gpu_used_bytes)
    }

    /// CPU usage over budget (0.0 to 1.0+)
    pub fn cpu_pressure(&self) -> f32 {
        if self.cpu_budget_bytes == 0 {
            return 0.0;
        }
        self.cpu_used_bytes as f32 / self.cpu_budget_bytes as f32
    }

    /// GPU usage over budget (0.0 to 1.0+)
    pub fn gpu_pressure(&self) -> f32 {
        if self.gpu_budget_bytes == 0 {
            return 0.0;
        }
        self.gpu_used_bytes as f32 / self.gpu_budget_bytes as f32
    }

    // --- Decisions ---

    /// True when `bytes` more GPU memory stays within budget
    pub fn gpu_fits(&self, bytes: u64) -> bool {
        self.gpu_available() >= bytes
    }

    /// True when `bytes` could ever fit, even with nothing resident
    pub fn gpu_can_ever_fit(&self, bytes: u64) -> bool {
        bytes <= self.gpu_budget_bytes
    }

    pub fn cpu_fits(&self, bytes: u64) -> bool {
        self.cpu_available() >= bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_budget_new() {
        let budget = MemoryBudget::new(512 * MB, 1024 * MB);
        assert_eq!(budget.cpu_used(), 0);
        assert_eq!(budget.gpu_available(), 1024 * MB);
    }

    #[test]
    fn test_budget_add_remove() {
        let mut budget = MemoryBudget::new(512 * MB, 1024 * MB);
        budget.add_gpu(200 * MB);
        budget.remove_gpu(50 * MB);
        assert_eq!(budget.gpu_used(), 150 * MB);
        budget.add_cpu(100 * MB);
        assert_eq!(budget.cpu_available(), 412 * MB);
    }

    #[test]
    fn test_budget_saturating_ops() {
        let mut budget = MemoryBudget::new(512 * MB, 1024 * MB);
        budget.remove_gpu(1000 * MB);
        assert_eq!(budget.gpu_used(), 0);
        budget.add_cpu(u64::MAX);
        budget.add_cpu(100);
        assert_eq!(budget.cpu_used(), u64::MAX);
    }

    #[test]
    fn test_budget_pressure() {
        let mut budget = MemoryBudget::new(100 * MB, 200 * MB);
        assert_eq!(budget.gpu_pressure(), 0.0);
        budget.add_gpu(100 * MB);
        assert!((budget.gpu_pressure() - 0.5).abs() < 0.01);
        budget.add_gpu(110 * MB);
        assert!(budget.gpu_pressure() > 1.0);
        assert_eq!(MemoryBudget::new(0, 0).cpu_pressure(), 0.0);
    }

    #[test]
    fn test_budget_fits() {
        let mut budget = MemoryBudget::new(100, 100);
        assert!(budget.gpu_fits(100));
        budget.add_gpu(60);
        assert!(!budget.gpu_fits(41));
        assert!(budget.gpu_can_ever_fit(100));
        assert!(!budget.gpu_can_ever_fit(101));
    }
}
