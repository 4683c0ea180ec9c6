//! HTTP jog-command coalescing — spec.md §4.H, §9 design notes.
//!
//! `/move` and `/lineto` accept `coalesce=<ms>`: consecutive requests of
//! the same kind accumulate their deltas (separately per unit) until a
//! timer fires, at which point a single move is dispatched and every
//! pending HTTP response resolves with the resulting position. Modeled
//! as a per-unit buffer `{ accumulator, pending resolvers, timer }`;
//! resolvers are captured synchronously at the moment the timer fires,
//! so a request arriving after that point starts a fresh buffer rather
//! than racing the dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ebb_protocol::{ControlError, Units};
use tokio::sync::{oneshot, Mutex};

use crate::motion::Position;

type DispatchFuture = Pin<Box<dyn Future<Output = Result<Position, ControlError>> + Send>>;
type DispatchFn = Arc<dyn Fn(f64, f64, Units) -> DispatchFuture + Send + Sync>;

struct Accumulator {
    dx: f64,
    dy: f64,
    resolvers: Vec<oneshot::Sender<Result<Position, ControlError>>>,
}

#[derive(Hash, Eq, PartialEq, Clone, Copy)]
struct UnitKey(u8);

fn unit_key(u: Units) -> UnitKey {
    UnitKey(match u {
        Units::Mm => 0,
        Units::Inches => 1,
        Units::Steps => 2,
    })
}

/// One coalescing buffer per HTTP endpoint kind (`/move`, `/lineto`).
/// Holds an independent accumulator per unit so a client jogging in mm
/// and one jogging in steps don't mix deltas. Must be held as `Arc` so
/// the fire timer can outlive the request that started it.
pub struct Coalescer {
    dispatch: DispatchFn,
    pending: Mutex<HashMap<UnitKey, Accumulator>>,
}

impl Coalescer {
    pub fn new(dispatch: DispatchFn) -> Arc<Self> {
        Arc::new(Self { dispatch, pending: Mutex::new(HashMap::new()) })
    }

    /// Submit a delta. If `coalesce_ms` is `None` or `0`, dispatches
    /// immediately. Otherwise accumulates and returns a future that
    /// resolves when the shared timer fires.
    pub async fn submit(
        self: &Arc<Self>,
        dx: f64,
        dy: f64,
        units: Units,
        coalesce_ms: Option<u64>,
    ) -> Result<Position, ControlError> {
        let Some(delay) = coalesce_ms.filter(|ms| *ms > 0) else {
            return (self.dispatch)(dx, dy, units).await;
        };

        let (tx, rx) = oneshot::channel();
        let should_spawn_timer = {
            let mut pending = self.pending.lock().await;
            let key = unit_key(units);
            let entry = pending
                .entry(key)
                .or_insert_with(|| Accumulator { dx: 0.0, dy: 0.0, resolvers: Vec::new() });
            entry.dx += dx;
            entry.dy += dy;
            entry.resolvers.push(tx);
            entry.resolvers.len() == 1
        };

        if should_spawn_timer {
            self.spawn_fire(units, Duration::from_millis(delay));
        }

        rx.await.unwrap_or(Err(ControlError::Timeout))
    }

    fn spawn_fire(self: &Arc<Self>, units: Units, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let key = unit_key(units);
            let accumulator = {
                let mut pending = this.pending.lock().await;
                pending.remove(&key)
            };
            let Some(accumulator) = accumulator else { return };

            let result = (this.dispatch)(accumulator.dx, accumulator.dy, units).await;
            for resolver in accumulator.resolvers {
                let _ = resolver.send(result.clone());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn accumulates_deltas_of_the_same_unit_into_one_dispatch() {
        let dispatch_count = Arc::new(AtomicUsize::new(0));
        let seen_dx = Arc::new(std::sync::Mutex::new(0.0_f64));
        let count = dispatch_count.clone();
        let seen = seen_dx.clone();
        let coalescer = Coalescer::new(Arc::new(move |dx: f64, _dy: f64, _units: Units| {
            count.fetch_add(1, Ordering::SeqCst);
            *seen.lock().unwrap() = dx;
            Box::pin(async move { Ok(Position { x: dx as i64, y: 0 }) }) as DispatchFuture
        }));

        let c1 = coalescer.clone();
        let c2 = coalescer.clone();
        let (r1, r2) = tokio::join!(
            c1.submit(1.0, 0.0, Units::Mm, Some(40)),
            c2.submit(2.0, 0.0, Units::Mm, Some(40)),
        );

        assert!(r1.is_ok());
        assert!(r2.is_ok());
        assert_eq!(dispatch_count.load(Ordering::SeqCst), 1);
        assert_eq!(*seen_dx.lock().unwrap(), 3.0);
    }

    #[tokio::test]
    async fn zero_coalesce_dispatches_immediately() {
        let dispatch_count = Arc::new(AtomicUsize::new(0));
        let count = dispatch_count.clone();
        let coalescer = Coalescer::new(Arc::new(move |_dx: f64, _dy: f64, _units: Units| {
            count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(Position::default()) }) as DispatchFuture
        }));

        let _ = coalescer.submit(1.0, 0.0, Units::Mm, None).await;
        assert_eq!(dispatch_count.load(Ordering::SeqCst), 1);
    }
}
