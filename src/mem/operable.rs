pub type Cycle = u64;

/// A unit advanced exactly once per simulated cycle by the driver.
///
/// All waiting is expressed through `event_cycle` stamps on queue entries; a
/// unit that cannot make progress simply returns and keeps its state for the
/// next cycle. Units never observe another unit's mid-cycle state because all
/// communication crosses a channel with at least one cycle of latency.
pub trait Operable {
    fn operate(&mut self, now: Cycle);

    /// Called at the start of a phase. Statistics are reset; architectural
    /// state is preserved so that warmup populates the hierarchy.
    fn begin_phase(&mut self, _warmup: bool) {}

    fn end_phase(&mut self) {}
}
