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

use crate::error::ConfigResult;
use clap::Parser;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{info, instrument, warn};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "PIERRE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub rtsp: RtspConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub desk: DeskConfig,
    #[serde(default)]
    pub dsp: DspConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub instance: InstanceConfig,
    /// Colon-separated MAC style id advertised to senders.
    pub device_id: String,
    pub model: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "pierre".to_owned(),
            instance: InstanceConfig::default(),
            device_id: default_device_id(),
            model: "Pierre3,1".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: gethostname().to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtspConfig {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockConfig {
    /// Control port of the external PTP helper on localhost.
    pub ctrl_port: u16,
    /// Override for the shared memory segment name; defaults to
    /// `/<service-name>-<device-id>`.
    pub shm_name: Option<String>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ctrl_port: 9000,
            shm_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeskConfig {
    /// Downstream DMX controller endpoint.
    pub endpoint: SocketAddr,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 49_152),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DspConfig {
    /// DSP worker count is `available_parallelism * concurrency_factor`,
    /// never less than one.
    pub concurrency_factor: f32,
    pub window: WindowConfig,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            concurrency_factor: 0.4,
            window: WindowConfig::Hann,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowConfig {
    Hann,
    BlackmanHarris,
}

impl Config {
    #[instrument]
    pub async fn load(path: Option<&Path>) -> ConfigResult<Config> {
        let Some(path) = path else {
            info!("No config file specified, using defaults.");
            return Ok(Config::default());
        };

        match fs::read_to_string(path).await {
            Ok(yaml) => Ok(serde_yaml::from_str(&yaml)?),
            Err(e) => {
                warn!("Could not read config file {}: {e}", path.display());
                Ok(Config::default())
            }
        }
    }

    /// Name of the PTP helper's shared memory segment.
    pub fn shm_name(&self) -> String {
        self.clock
            .shm_name
            .clone()
            .unwrap_or_else(|| format!("/{}-{}", self.app.name, self.app.device_id))
    }
}

fn default_device_id() -> String {
    // stable pseudo id derived from the hostname, good enough when no
    // explicit id is configured
    let host = gethostname();
    let bytes = host.as_encoded_bytes();
    let mut acc: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
    for (i, b) in bytes.iter().enumerate() {
        acc[1 + (i % 5)] ^= *b;
    }
    acc.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
