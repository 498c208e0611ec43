//! Feeding transport events into sessions.

use tracing::{debug, trace};

use crate::controller::Phase;
use crate::session::Session;

/// Upper bound on polling rounds in [`settle`]. A healthy set of sessions
/// goes quiet long before this.
pub const MAX_SETTLE_ROUNDS: usize = 10_000;

/// Drive `session` from its event queue until its endpoint is gone (closed,
/// never acquired, or destroyed). Returns the number of events handled.
///
/// Only the wait for the next event suspends; each event is handled to
/// completion before the next one is taken.
pub async fn run<S: Session + ?Sized>(session: &mut S) -> usize {
    let mut handled = 0;
    loop {
        if matches!(session.controller().phase(), Phase::Idle | Phase::Destroyed) {
            debug!(handled, "Session endpoint gone, driver stopping");
            return handled;
        }
        let Some(event) = session.controller().next_event().await else {
            return handled;
        };
        session.dispatch(event);
        handled += 1;
    }
}

/// Poll every session in turn until a full round handles no events.
/// Returns the total number of events handled.
pub fn settle(sessions: &mut [&mut dyn Session]) -> usize {
    let mut total = 0;
    for round in 0..MAX_SETTLE_ROUNDS {
        let handled: usize = sessions.iter_mut().map(|s| s.poll()).sum();
        if handled == 0 {
            trace!(round, total, "Sessions settled");
            return total;
        }
        total += handled;
    }
    debug!(total, "Sessions did not settle");
    total
}
