//! Push-based position source and the displacement filter that decides
//! whether an update is worth a distance sweep.

use tokio::sync::watch;
use tracing::debug;

use crate::geo::Position;

/// Latest known device position, published by the host.
#[derive(Debug, Clone)]
pub struct PositionSource {
    tx: watch::Sender<Option<Position>>,
}

impl PositionSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Out-of-range coordinates are dropped.
    pub fn publish(&self, position: Position) -> bool {
        if !position.is_valid() {
            debug!(target: "position", ?position, "ignoring invalid position");
            return false;
        }
        self.tx.send_replace(Some(position));
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Position>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<Position> {
        *self.tx.borrow()
    }
}

impl Default for PositionSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts the first position and then only moves of at least `min_meters`.
#[derive(Debug, Clone)]
pub struct DisplacementFilter {
    min_meters: f64,
    last_accepted: Option<Position>,
}

impl DisplacementFilter {
    pub fn new(min_meters: f64) -> Self {
        Self {
            min_meters: min_meters.max(0.0),
            last_accepted: None,
        }
    }

    pub fn seeded(min_meters: f64, last_accepted: Option<Position>) -> Self {
        Self {
            last_accepted,
            ..Self::new(min_meters)
        }
    }

    pub fn accept(&mut self, position: Position) -> bool {
        let moved_enough = self.would_accept(&position);
        if moved_enough {
            self.commit(position);
        }
        moved_enough
    }

    /// Checks `position` without recording it.
    pub fn would_accept(&self, position: &Position) -> bool {
        match self.last_accepted {
            None => true,
            Some(last) => last.distance_to(position) >= self.min_meters,
        }
    }

    /// Records `position` as the reference for later checks, regardless of
    /// distance.
    pub fn commit(&mut self, position: Position) {
        self.last_accepted = Some(position);
    }

    pub fn last_accepted(&self) -> Option<Position> {
        self.last_accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_moves_are_filtered() {
        let mut filter = DisplacementFilter::new(25.0);
        assert!(filter.accept(Position::new(0.0, 0.0)));
        // About 11 m east.
        assert!(!filter.accept(Position::new(0.0, 0.0001)));
        // About 111 m east of the first accepted point.
        assert!(filter.accept(Position::new(0.0, 0.001)));
        assert_eq!(filter.last_accepted(), Some(Position::new(0.0, 0.001)));
    }

    #[test]
    fn checking_does_not_move_the_reference() {
        let mut filter = DisplacementFilter::seeded(25.0, Some(Position::new(0.0, 0.0)));
        assert!(filter.would_accept(&Position::new(0.0, 0.01)));
        assert_eq!(filter.last_accepted(), Some(Position::new(0.0, 0.0)));
        filter.commit(Position::new(0.0, 0.00001));
        assert_eq!(filter.last_accepted(), Some(Position::new(0.0, 0.00001)));
    }

    #[tokio::test]
    async fn subscribers_see_the_latest_position() {
        let source = PositionSource::new();
        let mut rx = source.subscribe();
        assert!(source.publish(Position::new(40.0, -73.0)));
        assert!(!source.publish(Position::new(120.0, 0.0)));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(Position::new(40.0, -73.0)));
        assert_eq!(source.latest(), Some(Position::new(40.0, -73.0)));
    }
}
