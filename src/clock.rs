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

//! Master clock as published by the external PTP helper through a shared
//! memory segment. The block embeds a process-shared pthread mutex followed
//! by a packed struct; reads lock the mutex, copy the fields out and derive
//! a status from the snapshot's age.
//!
//! Timing peers are registered with the helper over a localhost UDP control
//! socket; updates are serialized behind a queue so each list is delivered
//! exactly once and in order.

use crate::error::{ClockError, ClockResult};
use shared_memory::{Shmem, ShmemConf};
use std::sync::Mutex;
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, instrument, warn};

pub const SHM_VERSION: u16 = 7;

/// Snapshot age ceiling for OK and mastership floor for STABLE.
pub const AGE_MAX_NS: i64 = 10_000_000_000;
pub const MASTER_MIN_NS: i64 = 5_000_000_000;

const MUTEX_TRY_MAX: u32 = 5;
const REMAP_FAIL_MAX: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClockStatus {
    Empty,
    Read,
    Ok,
    Stable,
}

/// One local view of the helper's data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClockInfo {
    pub clock_id: u64,
    pub master_ip: String,
    /// Local monotonic nanos at which the helper sampled the offset.
    pub sample_time: i64,
    /// Add to local monotonic time to get master clock time.
    pub raw_offset: i64,
    /// Local monotonic nanos at which the master became master.
    pub master_start_time: i64,
}

impl ClockInfo {
    pub fn status(&self, now_ns: i64) -> ClockStatus {
        if self.clock_id == 0 {
            return ClockStatus::Empty;
        }
        if now_ns - self.sample_time >= AGE_MAX_NS {
            return ClockStatus::Read;
        }
        if self.master_for(now_ns) >= MASTER_MIN_NS {
            ClockStatus::Stable
        } else {
            ClockStatus::Ok
        }
    }

    pub fn ok(&self, now_ns: i64) -> bool {
        self.status(now_ns) >= ClockStatus::Ok
    }

    pub fn stable(&self, now_ns: i64) -> bool {
        self.status(now_ns) >= ClockStatus::Stable
    }

    pub fn master_for(&self, now_ns: i64) -> i64 {
        if self.master_start_time == 0 {
            0
        } else {
            now_ns - self.master_start_time
        }
    }

    /// Master clock time of a local monotonic instant.
    pub fn master_time(&self, local_ns: i64) -> i64 {
        local_ns + self.raw_offset
    }

    /// Local monotonic instant of a master clock time.
    pub fn local_time(&self, master_ns: i64) -> i64 {
        master_ns - self.raw_offset
    }
}

/// Field offsets inside the block, packed after the platform-sized mutex.
mod layout {
    pub const VERSION: usize = 0;
    pub const CLOCK_ID: usize = 2;
    pub const MASTER_IP: usize = 10;
    pub const MASTER_IP_LEN: usize = 64;
    pub const LOCAL_TIME: usize = 74;
    pub const RAW_OFFSET: usize = 82;
    pub const MASTER_START: usize = 90;
    pub const FIELDS_LEN: usize = 98;
}

// The mapping is only touched under `MasterClockInner`'s mutex; Shmem keeps
// a raw pointer which makes it !Send by default.
struct ShmMap(Shmem);
unsafe impl Send for ShmMap {}

struct MasterClockInner {
    shm: Option<ShmMap>,
    mutex_failures: u32,
}

pub struct MasterClock {
    shm_name: String,
    inner: Mutex<MasterClockInner>,
    peers_tx: mpsc::Sender<Vec<String>>,
}

impl MasterClock {
    pub fn new(shm_name: String, peers_tx: mpsc::Sender<Vec<String>>) -> Self {
        Self {
            shm_name,
            inner: Mutex::new(MasterClockInner {
                shm: None,
                mutex_failures: 0,
            }),
            peers_tx,
        }
    }

    /// Read one snapshot. An unavailable or unreadable segment yields the
    /// default (EMPTY) info rather than an error; a version mismatch is
    /// fatal.
    pub fn info(&self) -> ClockResult<ClockInfo> {
        let Ok(mut inner) = self.inner.lock() else {
            return Ok(ClockInfo::default());
        };

        if inner.shm.is_none() {
            match ShmemConf::new().os_id(&self.shm_name).open() {
                Ok(shm) => {
                    debug!("mapped PTP shared memory segment {}", self.shm_name);
                    inner.shm = Some(ShmMap(shm));
                    inner.mutex_failures = 0;
                }
                Err(_) => return Ok(ClockInfo::default()),
            }
        }

        let read = {
            // the map exists, it was just ensured above
            let Some(shm) = inner.shm.as_ref() else {
                return Ok(ClockInfo::default());
            };
            read_block(&shm.0)
        };

        match read {
            Ok(info) => {
                inner.mutex_failures = 0;
                Ok(info)
            }
            Err(ClockError::MutexUnavailable) => {
                // a crashed writer can leave the embedded mutex held;
                // recover by remapping after repeated failures
                inner.mutex_failures += 1;
                if inner.mutex_failures >= REMAP_FAIL_MAX {
                    warn!("PTP shm mutex unavailable, remapping segment");
                    inner.shm = None;
                    inner.mutex_failures = 0;
                }
                Ok(ClockInfo::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Queue a timing peer list update for the helper; an empty list clears.
    pub fn update_peers(&self, peers: Vec<String>) {
        if self.peers_tx.try_send(peers).is_err() {
            warn!("PTP peer update queue full, dropping update");
        }
    }

    pub fn unmap(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.shm = None;
        }
    }
}

fn read_block(shm: &Shmem) -> ClockResult<ClockInfo> {
    if shm.len() < std::mem::size_of::<libc::pthread_mutex_t>() + layout::FIELDS_LEN {
        return Err(ClockError::MutexUnavailable);
    }

    let base = shm.as_ptr();
    let mutex = base as *mut libc::pthread_mutex_t;

    let mut locked = false;
    for _ in 0..MUTEX_TRY_MAX {
        match unsafe { libc::pthread_mutex_trylock(mutex) } {
            0 => {
                locked = true;
                break;
            }
            libc::EBUSY => std::thread::yield_now(),
            _ => break,
        }
    }
    if !locked {
        return Err(ClockError::MutexUnavailable);
    }

    let fields = unsafe { base.add(std::mem::size_of::<libc::pthread_mutex_t>()) };
    let read_u64 = |offset: usize| -> u64 {
        let mut bytes = [0u8; 8];
        unsafe { std::ptr::copy_nonoverlapping(fields.add(offset), bytes.as_mut_ptr(), 8) };
        u64::from_ne_bytes(bytes)
    };
    let read_u16 = |offset: usize| -> u16 {
        let mut bytes = [0u8; 2];
        unsafe { std::ptr::copy_nonoverlapping(fields.add(offset), bytes.as_mut_ptr(), 2) };
        u16::from_ne_bytes(bytes)
    };

    let version = read_u16(layout::VERSION);
    let clock_id = read_u64(layout::CLOCK_ID);
    let mut ip_bytes = [0u8; layout::MASTER_IP_LEN];
    unsafe {
        std::ptr::copy_nonoverlapping(
            fields.add(layout::MASTER_IP),
            ip_bytes.as_mut_ptr(),
            layout::MASTER_IP_LEN,
        );
    }
    let local_time = read_u64(layout::LOCAL_TIME);
    let raw_offset = read_u64(layout::RAW_OFFSET);
    let master_start = read_u64(layout::MASTER_START);

    unsafe { libc::pthread_mutex_unlock(mutex) };

    if version != SHM_VERSION {
        return Err(ClockError::VersionMismatch {
            expected: SHM_VERSION,
            found: version,
        });
    }

    let ip_len = ip_bytes.iter().position(|b| *b == 0).unwrap_or(ip_bytes.len());
    let master_ip = String::from_utf8_lossy(&ip_bytes[..ip_len]).to_string();

    Ok(ClockInfo {
        clock_id,
        master_ip,
        sample_time: local_time as i64,
        raw_offset: raw_offset as i64,
        master_start_time: master_start as i64,
    })
}

/// Subsystem that drains the peer update queue into the helper's control
/// port, one datagram per update: `"<shm-name> T[ <ip>]*\0"`.
#[instrument(skip(subsys, peers_rx))]
pub async fn run_peer_updater(
    subsys: SubsystemHandle,
    shm_name: String,
    ctrl_port: u16,
    mut peers_rx: mpsc::Receiver<Vec<String>>,
) -> ClockResult<()> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(("127.0.0.1", ctrl_port)).await?;
    info!("PTP control channel ready on port {ctrl_port}");

    loop {
        select! {
            Some(peers) = peers_rx.recv() => {
                let mut msg = format!("{shm_name} T");
                for peer in &peers {
                    msg.push(' ');
                    msg.push_str(peer);
                }
                msg.push('\0');

                if let Err(e) = socket.send(msg.as_bytes()).await {
                    warn!("could not send peer update to PTP helper: {e}");
                } else {
                    debug!("sent {} timing peer(s) to PTP helper", peers.len());
                }
            },
            _ = subsys.on_shutdown_requested() => break,
            else => break,
        }
    }

    info!("PTP control channel stopped.");
    Ok(())
}
