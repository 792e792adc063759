use crate::platform::Platform;

/// A suspended scheduler, resumed when dropped.
///
/// Every allocator operation runs inside one of these, so it cannot be
/// preempted by another task. The scheduler is resumed on every exit path,
/// including panics.
pub struct CriticalSection<'platform, P: Platform> {
    platform: &'platform P,
}
impl<'platform, P: Platform> CriticalSection<'platform, P> {
    /// Suspend the scheduler of `platform`.
    pub fn enter(platform: &'platform P) -> Self {
        platform.suspend_scheduler();
        Self { platform }
    }
}
impl<P: Platform> Drop for CriticalSection<'_, P> {
    fn drop(&mut self) {
        self.platform.resume_scheduler();
    }
}
