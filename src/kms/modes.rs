// src/kms/modes.rs

//! Discovery of connected outputs and the CRTC that will drive each one.

use crate::error::DeviceError;
use crate::kms::device::{
    CardResources, Connection, ConnectorInfo, DeviceHandle, KmsDevice, ModeInfo,
};
use log::{debug, info, warn};
use std::collections::BTreeSet;

/// A connected output, the mode it will run and the CRTC bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMode {
    pub connector_id: u32,
    pub connector_type: u32,
    pub crtc_id: u32,
    /// Position of `crtc_id` in the device's CRTC list; vblank waits use it.
    pub crtc_index: usize,
    pub mode: ModeInfo,
}

impl OutputMode {
    pub fn width(&self) -> u32 {
        self.mode.width()
    }

    pub fn height(&self) -> u32 {
        self.mode.height()
    }
}

/// Lists every connected connector with its first (preferred) mode.
///
/// Connectors already lit by an encoder keep that CRTC; the rest are given
/// whatever CRTCs remain. An empty result means nothing is plugged in; it is
/// not an error.
pub fn enumerate<D: KmsDevice>(handle: &DeviceHandle<D>) -> Result<Vec<OutputMode>, DeviceError> {
    let device = handle.device();
    let resources = device.resources().map_err(|source| DeviceError::Query {
        what: "card resources",
        source,
    })?;
    debug!(
        "card{}: {} connectors, {} encoders, {} CRTCs",
        handle.index(),
        resources.connector_ids.len(),
        resources.encoder_ids.len(),
        resources.crtc_ids.len()
    );

    // Active CRTCs are claimed before any fallback is handed out.
    let mut claimed = BTreeSet::new();
    let mut candidates = Vec::new();
    for &connector_id in &resources.connector_ids {
        let connector = device
            .connector(connector_id)
            .map_err(|source| DeviceError::Query {
                what: "connector",
                source,
            })?;
        if connector.connection != Connection::Connected {
            debug!("Connector {} is {:?}; skipping", connector_id, connector.connection);
            continue;
        }
        let Some(&mode) = connector.modes.first() else {
            warn!("Connector {} is connected but reports no modes; skipping", connector_id);
            continue;
        };
        let active = active_crtc(device, &resources, &connector)?;
        if let Some((crtc_id, _)) = active {
            if !claimed.insert(crtc_id) {
                return Err(DeviceError::CrtcConflict {
                    connector_id,
                    crtc_id,
                });
            }
        }
        candidates.push((connector, mode, active));
    }

    let mut outputs = Vec::with_capacity(candidates.len());
    for (connector, mode, active) in candidates {
        let resolved = match active {
            Some(crtc) => Some(crtc),
            None => free_crtc(device, &resources, &connector, &claimed),
        };
        let Some((crtc_id, crtc_index)) = resolved else {
            warn!("No free CRTC can drive connector {}; skipping", connector.connector_id);
            continue;
        };
        claimed.insert(crtc_id);

        info!(
            "Output: connector {} on CRTC {} (index {}), mode {:?}",
            connector.connector_id, crtc_id, crtc_index, mode
        );
        outputs.push(OutputMode {
            connector_id: connector.connector_id,
            connector_type: connector.connector_type,
            crtc_id,
            crtc_index,
            mode,
        });
    }
    Ok(outputs)
}

fn crtc_index(resources: &CardResources, crtc_id: u32) -> Option<usize> {
    resources.crtc_ids.iter().position(|&id| id == crtc_id)
}

/// The CRTC the connector's current encoder is driving, if any.
fn active_crtc<D: KmsDevice>(
    device: &D,
    resources: &CardResources,
    connector: &ConnectorInfo,
) -> Result<Option<(u32, usize)>, DeviceError> {
    if connector.encoder_id == 0 {
        return Ok(None);
    }
    let encoder = device
        .encoder(connector.encoder_id)
        .map_err(|source| DeviceError::Query {
            what: "encoder",
            source,
        })?;
    if encoder.crtc_id == 0 {
        return Ok(None);
    }
    match crtc_index(resources, encoder.crtc_id) {
        Some(index) => Ok(Some((encoder.crtc_id, index))),
        None => {
            warn!(
                "Encoder {} points at unknown CRTC {}",
                encoder.encoder_id, encoder.crtc_id
            );
            Ok(None)
        }
    }
}

/// The first unclaimed CRTC any of the connector's encoders can reach.
fn free_crtc<D: KmsDevice>(
    device: &D,
    resources: &CardResources,
    connector: &ConnectorInfo,
    claimed: &BTreeSet<u32>,
) -> Option<(u32, usize)> {
    for &encoder_id in &connector.encoder_ids {
        let encoder = match device.encoder(encoder_id) {
            Ok(encoder) => encoder,
            Err(e) => {
                debug!("Skipping encoder {}: {}", encoder_id, e);
                continue;
            }
        };
        for (index, &crtc_id) in resources.crtc_ids.iter().enumerate() {
            if index < 32 && encoder.possible_crtcs & (1 << index) != 0 && !claimed.contains(&crtc_id)
            {
                return Some((crtc_id, index));
            }
        }
    }
    None
}
