// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Runs `action` every `period` until the shutdown signal flips. The
/// reconcile, keepalive, and relay sampler loops are all instances of this.
pub async fn run_periodically<F, Fut>(
	mut shutdown: watch::Receiver<bool>,
	period: Duration,
	mut action: F,
) where
	F: FnMut() -> Fut,
	Fut: Future<Output = ()>,
{
	let mut timer = tokio::time::interval(period);
	timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			biased;

			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					return;
				}
			}

			_ = timer.tick() => {
				action().await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	#[tokio::test(start_paused = true)]
	async fn action_fires_on_every_tick() {
		let count = Arc::new(AtomicUsize::new(0));
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let task_count = count.clone();
		let handle = tokio::spawn(run_periodically(
			shutdown_rx,
			Duration::from_secs(5),
			move || {
				let count = task_count.clone();
				async move {
					count.fetch_add(1, Ordering::SeqCst);
				}
			},
		));

		tokio::time::sleep(Duration::from_secs(16)).await;
		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();

		// the first tick fires immediately, then at 5s, 10s, 15s
		assert_eq!(count.load(Ordering::SeqCst), 4);
	}

	#[tokio::test]
	async fn shutdown_stops_the_loop() {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let handle = tokio::spawn(run_periodically(
			shutdown_rx,
			Duration::from_millis(10),
			|| async {},
		));

		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
	}
}
