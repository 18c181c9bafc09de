use crate::types::Tick;

/// Receives every decoded tick, in socket order, on the delivery task.
///
/// Implementations must return quickly: a slow observer stalls the feed.
pub trait TickObserver: Send + Sync {
    fn on_tick(&self, tick: &Tick);
}

impl<F> TickObserver for F
where
    F: Fn(&Tick) + Send + Sync,
{
    fn on_tick(&self, tick: &Tick) {
        self(tick)
    }
}
