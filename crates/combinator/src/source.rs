//! What the scheduler pulls media from.

use async_trait::async_trait;
use mc_clip::{Mp4Clip, TickOutput};
use mc_common::{EngineResult, Micros};

/// A timeline-addressable media source.
///
/// `tick` is called with non-decreasing times relative to the source's own
/// start. Audio in the output covers the time since the previous tick.
#[async_trait]
pub trait Source: Send {
    fn duration(&self) -> Micros;

    async fn tick(&mut self, time: Micros) -> EngineResult<TickOutput>;

    /// Release decoders. Called once the source leaves the timeline.
    fn destroy(&mut self);
}

#[async_trait]
impl Source for Mp4Clip {
    fn duration(&self) -> Micros {
        Mp4Clip::duration(self)
    }

    async fn tick(&mut self, time: Micros) -> EngineResult<TickOutput> {
        Mp4Clip::tick(self, time).await
    }

    fn destroy(&mut self) {
        Mp4Clip::destroy(self)
    }
}
