/*
 *  Copyright (C) 2025 Pierre Contributors
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Cold start behavior: with the PTP shared memory unavailable the anchor
//! never fuses, nothing is emitted while idle, and the whole supervisor
//! tears down cleanly.

#![allow(clippy::unwrap_used)]

use pierre::{
    anchor::{Anchor, AnchorData},
    clock::MasterClock,
    config::Config,
    supervisor, time,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

#[test]
fn anchor_stays_invalid_without_shared_memory() {
    let (peers_tx, _peers_rx) = mpsc::channel(4);
    let clock = MasterClock::new("/pierre-cold-start-none".into(), peers_tx);
    let anchor = Anchor::new();
    anchor.save(AnchorData::new(0xAAAA, 100, 0, 4096, 0), time::monotonic_ns());

    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    while std::time::Instant::now() < deadline {
        let info = clock.info().unwrap();
        assert!(anchor.current(&info, time::monotonic_ns()).is_none());
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[tokio::test]
async fn supervisor_boots_and_shuts_down_cleanly() {
    let config = Config {
        rtsp: pierre::config::RtspConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
        },
        // a desk endpoint nothing listens on; the writer must keep
        // retrying without failing the supervisor
        desk: pierre::config::DeskConfig {
            endpoint: "127.0.0.1:1".parse().unwrap(),
        },
        ..Config::default()
    };

    let toplevel = Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("pierre", move |s| async move {
            supervisor::start(&s, config).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            s.request_shutdown();
            Ok::<(), pierre::error::SupervisorError>(())
        }));
    });

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        toplevel.handle_shutdown_requests(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    assert!(result.is_ok(), "supervisor did not shut down cleanly: {result:?}");
}
