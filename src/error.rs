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

use miette::Diagnostic;
use shared_memory::ShmemError;
use std::io;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug, Diagnostic)]
pub enum SystemClockError {
    #[error("could not read system clock: {0}")]
    ClockGetTime(String),
}

pub type SystemClockResult<T> = Result<T, SystemClockError>;

#[derive(Error, Debug, Diagnostic)]
pub enum CipherError {
    #[error("AEAD authentication failed")]
    CipherFailure,
    #[error("malformed TLV8 data")]
    InvalidTlv,
    #[error("pair-{phase} step out of sequence (state {state})")]
    StepOutOfSequence { phase: &'static str, state: u8 },
    #[error("SRP authentication failed")]
    SrpFailure,
    #[error("peer signature rejected")]
    BadSignature,
    #[error("sealed block exceeds maximum length: {0}")]
    BlockTooLong(usize),
}

pub type CipherResult<T> = Result<T, CipherError>;

#[derive(Error, Debug, Diagnostic)]
pub enum RtspError {
    #[error("malformed request: {0}")]
    InvalidRequest(String),
    #[error("malformed property list body")]
    InvalidPlist,
    #[error("unsupported timing protocol: {0}")]
    UnsupportedTimingProtocol(String),
    #[error("stream description is missing key: {0}")]
    MissingStreamKey(&'static str),
    #[error("cipher error: {0}")]
    CipherError(#[from] CipherError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

pub type RtspResult<T> = Result<T, RtspError>;

#[derive(Error, Debug, Diagnostic)]
pub enum ClockError {
    #[error("shared memory error: {0}")]
    SharedMemoryError(#[from] ShmemError),
    #[error("shared memory version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u16, found: u16 },
    #[error("shared memory mutex unavailable")]
    MutexUnavailable,
    #[error("system clock error: {0}")]
    SystemClockError(#[from] SystemClockError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

pub type ClockResult<T> = Result<T, ClockError>;

#[derive(Error, Debug, Diagnostic)]
pub enum FrameError {
    #[error("packet too short for RTP header: {0} bytes")]
    PacketTooShort(usize),
    #[error("unsupported RTP version: {0}")]
    UnsupportedVersion(u8),
    #[error("payload decipher failed")]
    DecipherFailed,
    #[error("audio decode failed: {0}")]
    DecodeFailed(String),
    #[error("no shared session key")]
    MissingSessionKey,
}

pub type FrameResult<T> = Result<T, FrameError>;

#[derive(Error, Debug, Diagnostic)]
pub enum DeskError {
    #[error("message encode error: {0}")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("message decode error: {0}")]
    DecodeError(#[from] rmp_serde::decode::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

pub type DeskResult<T> = Result<T, DeskError>;

#[derive(Error, Debug, Diagnostic)]
pub enum SupervisorError {
    #[error("config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("RTSP error: {0}")]
    RtspError(#[from] RtspError),
    #[error("desk error: {0}")]
    DeskError(#[from] DeskError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("channel error")]
    ChannelError(#[from] oneshot::error::RecvError),
    #[error("watchdog detected stalled pipeline: {0}")]
    PipelineStalled(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
