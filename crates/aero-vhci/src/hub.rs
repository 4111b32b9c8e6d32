//! Root-hub class request emulation (USB 2.0 section 11.24).

use serde::{Deserialize, Serialize};

use crate::error::{Result, VhciError};
use crate::feature;
use crate::port::PortChange;
use crate::state::ControllerState;

const USB_DESCRIPTOR_TYPE_HUB: u8 = 0x29;

// Per-port power switching, no over-current reporting.
const HUB_W_HUB_CHARACTERISTICS: u16 = 0x0009;

/// Decoded `typeReq` (`bmRequestType << 8 | bRequest`) of a root-hub request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HubRequestType {
    ClearHubFeature,
    SetHubFeature,
    ClearPortFeature,
    SetPortFeature,
    GetHubDescriptor,
    GetHubStatus,
    GetPortStatus,
}

impl HubRequestType {
    pub fn from_raw(type_req: u16) -> Option<Self> {
        Some(match type_req {
            0x2001 => HubRequestType::ClearHubFeature,
            0x2003 => HubRequestType::SetHubFeature,
            0x2301 => HubRequestType::ClearPortFeature,
            0x2303 => HubRequestType::SetPortFeature,
            0xa006 => HubRequestType::GetHubDescriptor,
            0xa000 => HubRequestType::GetHubStatus,
            0xa300 => HubRequestType::GetPortStatus,
            _ => return None,
        })
    }

    pub fn raw(self) -> u16 {
        match self {
            HubRequestType::ClearHubFeature => 0x2001,
            HubRequestType::SetHubFeature => 0x2003,
            HubRequestType::ClearPortFeature => 0x2301,
            HubRequestType::SetPortFeature => 0x2303,
            HubRequestType::GetHubDescriptor => 0xa006,
            HubRequestType::GetHubStatus => 0xa000,
            HubRequestType::GetPortStatus => 0xa300,
        }
    }
}

/// A root-hub control request as issued by the USB core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubRequest {
    pub type_req: u16,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl HubRequest {
    pub fn new(kind: HubRequestType, value: u16, index: u16, length: u16) -> Self {
        Self {
            type_req: kind.raw(),
            value,
            index,
            length,
        }
    }

    pub fn set_port_feature(port: u16, selector: u16) -> Self {
        Self::new(HubRequestType::SetPortFeature, selector, port, 0)
    }

    pub fn clear_port_feature(port: u16, selector: u16) -> Self {
        Self::new(HubRequestType::ClearPortFeature, selector, port, 0)
    }

    pub fn get_port_status(port: u16) -> Self {
        Self::new(HubRequestType::GetPortStatus, 0, port, 4)
    }
}

/// Length of a hub port bitmap: one bit per port plus the reserved bit 0.
pub(crate) fn hub_bitmap_len(port_count: u8) -> usize {
    usize::from(port_count) / 8 + 1
}

/// Builds the hub class descriptor (11.23.2.1), truncated to `w_length`.
///
/// `bDescLength` reports the length actually returned.
pub fn hub_descriptor(port_count: u8, w_length: u16) -> Vec<u8> {
    let bitmap_len = hub_bitmap_len(port_count);
    let full_len = 7 + 2 * bitmap_len;
    let len = full_len.min(usize::from(w_length));

    let mut desc = Vec::with_capacity(full_len);
    desc.push(len as u8); // bDescLength
    desc.push(USB_DESCRIPTOR_TYPE_HUB);
    desc.push(port_count); // bNbrPorts
    desc.extend_from_slice(&HUB_W_HUB_CHARACTERISTICS.to_le_bytes());
    desc.push(0x00); // bPwrOn2PwrGood
    desc.push(0x00); // bHubContrCurrent
    desc.extend(core::iter::repeat(0u8).take(bitmap_len)); // DeviceRemovable
    desc.extend(core::iter::repeat(0xffu8).take(bitmap_len)); // PortPwrCtrlMask
    desc.truncate(len);
    desc
}

/// Maps a `C_PORT_*` feature selector to its change bit.
fn change_bit(selector: u16) -> Option<PortChange> {
    let shift = selector.checked_sub(feature::C_PORT_CONNECTION)?;
    if selector > feature::C_PORT_RESET {
        return None;
    }
    PortChange::from_bits(1 << shift)
}

impl ControllerState {
    /// Handles one root-hub request and returns the response bytes (empty for requests without a
    /// data stage).
    pub fn hub_control(&mut self, request: HubRequest) -> Result<Vec<u8>> {
        if !self.hw_accessible {
            return Err(VhciError::NotReady);
        }
        let result = self.dispatch_hub_request(request);
        if let Err(VhciError::ProtocolStall) = result {
            tracing::debug!(
                type_req = request.type_req,
                value = request.value,
                index = request.index,
                length = request.length,
                "hub request stalled"
            );
        }
        if self.any_port_change() {
            self.effects.poll_root_hub = true;
        }
        result
    }

    fn dispatch_hub_request(&mut self, request: HubRequest) -> Result<Vec<u8>> {
        let HubRequest {
            value,
            index,
            length,
            ..
        } = request;
        let kind = HubRequestType::from_raw(request.type_req).ok_or(VhciError::ProtocolStall)?;
        match kind {
            HubRequestType::ClearHubFeature | HubRequestType::SetHubFeature => {
                if index != 0
                    || length != 0
                    || !matches!(
                        value,
                        feature::C_HUB_LOCAL_POWER | feature::C_HUB_OVER_CURRENT
                    )
                {
                    return Err(VhciError::ProtocolStall);
                }
                Ok(Vec::new())
            }
            HubRequestType::ClearPortFeature => {
                if length != 0 {
                    return Err(VhciError::ProtocolStall);
                }
                self.clear_port_feature(index, value)?;
                Ok(Vec::new())
            }
            HubRequestType::SetPortFeature => {
                if length != 0 {
                    return Err(VhciError::ProtocolStall);
                }
                self.set_port_feature(index, value)?;
                Ok(Vec::new())
            }
            HubRequestType::GetHubDescriptor => {
                if index != 0 {
                    return Err(VhciError::ProtocolStall);
                }
                Ok(hub_descriptor(self.port_count(), length))
            }
            HubRequestType::GetHubStatus => {
                if value != 0 || index != 0 || length != 4 {
                    return Err(VhciError::ProtocolStall);
                }
                Ok(vec![0; 4])
            }
            HubRequestType::GetPortStatus => {
                if value != 0 || length != 4 {
                    return Err(VhciError::ProtocolStall);
                }
                let port = self.port_mut(index).ok_or(VhciError::ProtocolStall)?;
                let mut out = Vec::with_capacity(4);
                out.extend_from_slice(&port.status.bits().to_le_bytes());
                out.extend_from_slice(&port.change.bits().to_le_bytes());
                Ok(out)
            }
        }
    }

    fn clear_port_feature(&mut self, index: u16, selector: u16) -> Result<()> {
        let port = self.port_mut(index).ok_or(VhciError::ProtocolStall)?;
        let changed = match selector {
            feature::PORT_SUSPEND => port.request_resume(),
            feature::PORT_POWER => port.power_off(),
            feature::PORT_ENABLE => port.disable(),
            feature::PORT_CONNECTION
            | feature::PORT_OVER_CURRENT
            | feature::PORT_RESET
            | feature::PORT_LOW_SPEED
            | feature::PORT_HIGH_SPEED
            | feature::PORT_INDICATOR => false,
            _ => {
                let change = change_bit(selector).ok_or(VhciError::ProtocolStall)?;
                port.clear_change(change)
            }
        };
        if changed {
            tracing::debug!(port = index, selector, "clear port feature");
            // `port_mut` succeeded, so `index` is 1..=MAX_PORTS.
            self.mark_port_update(index as u8);
        }
        Ok(())
    }

    fn set_port_feature(&mut self, index: u16, selector: u16) -> Result<()> {
        let port = self.port_mut(index).ok_or(VhciError::ProtocolStall)?;
        let changed = match selector {
            feature::PORT_SUSPEND => port.suspend(),
            feature::PORT_POWER => port.power_on(),
            feature::PORT_RESET => port.start_reset(),
            feature::PORT_CONNECTION
            | feature::PORT_OVER_CURRENT
            | feature::PORT_LOW_SPEED
            | feature::PORT_HIGH_SPEED
            | feature::PORT_INDICATOR => false,
            _ => {
                let change = change_bit(selector).ok_or(VhciError::ProtocolStall)?;
                port.set_change(change)
            }
        };
        if changed {
            tracing::debug!(port = index, selector, "set port feature");
            self.mark_port_update(index as u8);
        }
        Ok(())
    }
}
