//! Placement of a source on the timeline.

use mc_common::Micros;

use crate::canvas::Placement;
use crate::source::Source;

/// A source positioned in time, on a layer and on the canvas.
///
/// ```ignore
/// let sprite = Sprite::new(Box::new(clip))
///     .offset(2_000_000)
///     .layer(1)
///     .placement(Placement::new(0, 0, 640, 360))
///     .main();
/// ```
pub struct Sprite {
    pub(crate) source: Box<dyn Source>,
    /// Timeline time of the source's first frame.
    pub offset: Micros,
    /// Overrides the source duration when set.
    pub duration: Option<Micros>,
    /// Higher layers are drawn on top; equal layers keep insertion order.
    pub layer: i32,
    /// `None` stretches the frame over the whole canvas.
    pub placement: Option<Placement>,
    pub volume: f32,
    pub muted: bool,
    /// The session ends when the main sprite does.
    pub main: bool,
}

impl Sprite {
    pub fn new(source: Box<dyn Source>) -> Self {
        Self {
            source,
            offset: 0,
            duration: None,
            layer: 0,
            placement: None,
            volume: 1.0,
            muted: false,
            main: false,
        }
    }

    pub fn offset(mut self, offset: Micros) -> Self {
        self.offset = offset.max(0);
        self
    }

    pub fn duration(mut self, duration: Micros) -> Self {
        self.duration = Some(duration.max(0));
        self
    }

    pub fn layer(mut self, layer: i32) -> Self {
        self.layer = layer;
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn volume(mut self, volume: f32) -> Self {
        self.volume = volume.max(0.0);
        self
    }

    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn main(mut self) -> Self {
        self.main = true;
        self
    }

    /// Timeline time at which the sprite leaves.
    pub fn end(&self) -> Micros {
        self.offset + self.duration.unwrap_or_else(|| self.source.duration())
    }

    /// Whether the sprite is visible at timeline `time`.
    pub fn covers(&self, time: Micros) -> bool {
        self.offset <= time && time < self.end()
    }

    /// Source-relative time for timeline `time`.
    pub fn local_time(&self, time: Micros) -> Micros {
        (time - self.offset).max(0)
    }
}

impl std::fmt::Debug for Sprite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sprite")
            .field("offset", &self.offset)
            .field("end", &self.end())
            .field("layer", &self.layer)
            .field("main", &self.main)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mc_clip::{TickOutput, TickState};
    use mc_common::{AudioData, EngineResult};

    struct Fixed(Micros);

    #[async_trait]
    impl Source for Fixed {
        fn duration(&self) -> Micros {
            self.0
        }

        async fn tick(&mut self, time: Micros) -> EngineResult<TickOutput> {
            Ok(TickOutput {
                video: None,
                audio: AudioData::new(time, 48_000, vec![Vec::new(); 2]),
                state: TickState::Success,
            })
        }

        fn destroy(&mut self) {}
    }

    #[test]
    fn window_follows_offset_and_source_duration() {
        let sprite = Sprite::new(Box::new(Fixed(1_000_000))).offset(500_000);
        assert_eq!(sprite.end(), 1_500_000);
        assert!(!sprite.covers(499_999));
        assert!(sprite.covers(500_000));
        assert!(sprite.covers(1_499_999));
        assert!(!sprite.covers(1_500_000));
        assert_eq!(sprite.local_time(800_000), 300_000);
        assert_eq!(sprite.local_time(0), 0);
    }

    #[test]
    fn explicit_duration_overrides_source() {
        let sprite = Sprite::new(Box::new(Fixed(1_000_000))).duration(250_000).main();
        assert_eq!(sprite.end(), 250_000);
        assert!(sprite.main);
    }
}
