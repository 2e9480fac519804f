//! USB device discovery
//!
//! Finds devices of interest by VID/PID filter, opens one, and locates the
//! endpoint to stream from: claims the interface holding it, selects the
//! matching alternate setting and resolves the packet size a request is
//! built from.

use crate::config::TransferType;
use crate::error::DeviceError;
use crate::transport::libusb::UsbTransport;
use rusb::{Context, Device, DeviceHandle, Speed, UsbContext};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// SuperSpeed endpoint companion descriptor type
const SS_ENDPOINT_COMPANION: u8 = 0x30;

/// `VID:PID` filter, either half may be `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn new(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|vid| vid == vendor_id)
            && self.product_id.is_none_or(|pid| pid == product_id)
    }
}

fn parse_id(part: &str) -> Option<Option<u16>> {
    let part = part.trim();
    if part == "*" {
        return Some(None);
    }
    let hex = part
        .strip_prefix("0x")
        .or_else(|| part.strip_prefix("0X"))
        .unwrap_or(part);
    if hex.is_empty() || hex.len() > 4 {
        return None;
    }
    u16::from_str_radix(hex, 16).ok().map(Some)
}

impl FromStr for DeviceFilter {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DeviceError::InvalidFilter(s.to_string());
        let (vid, pid) = s.split_once(':').ok_or_else(invalid)?;
        let vendor_id = parse_id(vid).ok_or_else(invalid)?;
        let product_id = parse_id(pid).ok_or_else(invalid)?;
        Ok(Self {
            vendor_id,
            product_id,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(vid) => write!(f, "0x{:04x}", vid)?,
            None => f.write_str("*")?,
        }
        match self.product_id {
            Some(pid) => write!(f, ":0x{:04x}", pid),
            None => f.write_str(":*"),
        }
    }
}

/// A filter plus the name shown for devices it matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownDevice {
    pub filter: DeviceFilter,
    pub description: String,
}

impl KnownDevice {
    pub fn new(filter: DeviceFilter, description: impl Into<String>) -> Self {
        Self {
            filter,
            description: description.into(),
        }
    }
}

/// First entry of `known` matching the VID/PID; an empty list matches everything
fn lookup(known: &[KnownDevice], vendor_id: u16, product_id: u16) -> Option<Option<&str>> {
    if known.is_empty() {
        return Some(None);
    }
    known
        .iter()
        .find(|entry| entry.filter.matches(vendor_id, product_id))
        .map(|entry| Some(entry.description.as_str()))
}

/// A device of interest as found on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub speed: Speed,
    pub description: Option<String>,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x} {}",
            self.bus_number,
            self.address,
            self.vendor_id,
            self.product_id,
            speed_name(self.speed)
        )?;
        if let Some(description) = &self.description {
            write!(f, " {}", description)?;
        }
        Ok(())
    }
}

pub fn speed_name(speed: Speed) -> &'static str {
    match speed {
        Speed::Low => "low-speed",
        Speed::Full => "full-speed",
        Speed::High => "high-speed",
        Speed::Super => "SuperSpeed",
        Speed::SuperPlus => "SuperSpeed+",
        _ => "unknown-speed",
    }
}

fn is_super_speed(speed: Speed) -> bool {
    matches!(speed, Speed::Super | Speed::SuperPlus)
}

fn devices_of_interest(
    context: &Context,
    known: &[KnownDevice],
) -> Result<Vec<(Device<Context>, DeviceSummary)>, DeviceError> {
    let mut found = Vec::new();

    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(
                    "Failed to read device descriptor on bus {} address {}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };

        let (vid, pid) = (descriptor.vendor_id(), descriptor.product_id());
        let Some(description) = lookup(known, vid, pid) else {
            debug!("Device ignored by filter: vid={:#06x}, pid={:#06x}", vid, pid);
            continue;
        };

        let summary = DeviceSummary {
            bus_number: device.bus_number(),
            address: device.address(),
            vendor_id: vid,
            product_id: pid,
            speed: device.speed(),
            description: description.map(str::to_string),
        };
        found.push((device, summary));
    }

    Ok(found)
}

/// Enumerate the devices of interest currently attached
pub fn list_devices(
    context: &Context,
    known: &[KnownDevice],
) -> Result<Vec<DeviceSummary>, DeviceError> {
    Ok(devices_of_interest(context, known)?
        .into_iter()
        .map(|(_, summary)| summary)
        .collect())
}

/// Open the `index`th device of interest
pub fn open_device(
    context: &Context,
    known: &[KnownDevice],
    index: usize,
) -> Result<OpenDevice, DeviceError> {
    let mut found = devices_of_interest(context, known)?;
    if found.is_empty() {
        return Err(DeviceError::NoDevice);
    }
    let count = found.len();
    if index >= count {
        return Err(DeviceError::IndexOutOfRange { index, count });
    }

    let (device, summary) = found.swap_remove(index);
    let handle = device.open()?;
    info!("Opened {}", summary);

    Ok(OpenDevice {
        context: context.clone(),
        device,
        handle: Arc::new(handle),
        summary,
        claimed: Vec::new(),
    })
}

/// Streaming endpoint located on an open device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub interface: u8,
    pub alt_setting: u8,
    pub transfer_type: TransferType,
    /// Raw `wMaxPacketSize`
    pub max_packet_size: u16,
    pub interval: u8,
    pub companion: Option<SsCompanion>,
    /// Bytes per packet a request is built from
    pub packet_size: usize,
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "endpoint 0x{:02x} ({}) on interface {} alt {}, wMaxPacketSize {}",
            self.address, self.transfer_type, self.interface, self.alt_setting, self.max_packet_size
        )?;
        if let Some(companion) = self.companion {
            write!(
                f,
                ", bMaxBurst {}, Mult {}",
                companion.max_burst, companion.mult
            )?;
        }
        write!(f, ", packet size {} bytes", self.packet_size)
    }
}

/// Fields of a SuperSpeed endpoint companion descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SsCompanion {
    pub max_burst: u8,
    /// Isochronous burst multiplier, from bmAttributes bits 0-1
    pub mult: u8,
}

/// Find the SuperSpeed endpoint companion in an endpoint's extra descriptor bytes
pub fn parse_ss_companion(extra: &[u8]) -> Option<SsCompanion> {
    let mut rest = extra;
    while rest.len() >= 2 {
        let length = rest[0] as usize;
        if length < 2 || length > rest.len() {
            return None;
        }
        if rest[1] == SS_ENDPOINT_COMPANION && length >= 4 {
            return Some(SsCompanion {
                max_burst: rest[2],
                mult: rest[3] & 0x03,
            });
        }
        rest = &rest[length..];
    }
    None
}

/// Bytes per packet for an endpoint at the given link speed
///
/// SuperSpeed endpoints move `bMaxBurst + 1` packets per service interval
/// (times `Mult + 1` for isochronous). High-bandwidth USB 2.0 isochronous
/// endpoints encode extra transactions per micro-frame in bits 11-12 of
/// `wMaxPacketSize`.
pub fn resolve_packet_size(
    speed: Speed,
    transfer_type: TransferType,
    max_packet_size: u16,
    companion: Option<SsCompanion>,
) -> usize {
    let mps = max_packet_size as usize;

    if is_super_speed(speed) {
        let companion = companion.unwrap_or_default();
        let mut size = mps * (companion.max_burst as usize + 1);
        if transfer_type == TransferType::Isochronous {
            size *= companion.mult as usize + 1;
        }
        return size;
    }

    if transfer_type == TransferType::Isochronous {
        return (mps & 0x7FF) * (1 + ((mps >> 11) & 0x3));
    }

    mps
}

/// Configuration descriptor fields for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationSummary {
    pub active_configuration: u8,
    pub configuration_value: u8,
    pub num_interfaces: u8,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    /// Maximum power draw in mA
    pub max_power: u16,
    pub description_index: Option<u8>,
}

impl fmt::Display for ConfigurationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Active configuration: {}", self.active_configuration)?;
        writeln!(f, "Configuration descriptor:")?;
        writeln!(f, "  bConfigurationValue: {}", self.configuration_value)?;
        writeln!(f, "  bNumInterfaces:      {}", self.num_interfaces)?;
        writeln!(f, "  Self powered:        {}", self.self_powered)?;
        writeln!(f, "  Remote wakeup:       {}", self.remote_wakeup)?;
        writeln!(f, "  MaxPower:            {} mA", self.max_power)?;
        match self.description_index {
            Some(index) => write!(f, "  iConfiguration:      {}", index),
            None => write!(f, "  iConfiguration:      0"),
        }
    }
}

/// An opened device of interest
///
/// Interfaces claimed by [`OpenDevice::locate_endpoint`] are released when
/// this is dropped.
pub struct OpenDevice {
    context: Context,
    device: Device<Context>,
    handle: Arc<DeviceHandle<Context>>,
    summary: DeviceSummary,
    claimed: Vec<u8>,
}

impl OpenDevice {
    pub fn summary(&self) -> &DeviceSummary {
        &self.summary
    }

    pub fn speed(&self) -> Speed {
        self.summary.speed
    }

    /// Transport streaming through this device's handle
    pub fn transport(&self) -> UsbTransport {
        UsbTransport::new(self.context.clone(), self.handle.clone())
    }

    /// Active configuration and the descriptor of the first configuration
    pub fn describe_configuration(&self) -> Result<ConfigurationSummary, DeviceError> {
        let active_configuration = self.handle.active_configuration()?;
        let config = self.device.config_descriptor(0)?;

        Ok(ConfigurationSummary {
            active_configuration,
            configuration_value: config.number(),
            num_interfaces: config.num_interfaces(),
            self_powered: config.self_powered(),
            remote_wakeup: config.remote_wakeup(),
            max_power: config.max_power(),
            description_index: config.description_string_index(),
        })
    }

    /// Claim the interface holding `endpoint` and select its alternate setting
    ///
    /// Every interface is claimed in turn and searched; interfaces that do not
    /// contain the endpoint are released again.
    pub fn locate_endpoint(&mut self, endpoint: u8) -> Result<EndpointInfo, DeviceError> {
        let config = self.device.config_descriptor(0)?;

        for interface in config.interfaces() {
            let number = interface.number();
            self.claim(number)?;

            let found = interface.descriptors().find_map(|alt| {
                alt.endpoint_descriptors()
                    .find(|ep| ep.address() == endpoint)
                    .map(|ep| (alt.setting_number(), ep))
            });

            let Some((alt_setting, ep)) = found else {
                self.release(number);
                continue;
            };

            let transfer_type = TransferType::from_rusb(ep.transfer_type())
                .ok_or(DeviceError::ControlEndpoint { endpoint })?;

            if alt_setting != 0 {
                self.handle.set_alternate_setting(number, alt_setting)?;
                debug!("Selected alternate setting {} on interface {}", alt_setting, number);
            }

            let companion = if is_super_speed(self.speed()) {
                ep.extra().and_then(parse_ss_companion)
            } else {
                None
            };
            let max_packet_size = ep.max_packet_size();
            let packet_size =
                resolve_packet_size(self.speed(), transfer_type, max_packet_size, companion);

            let info = EndpointInfo {
                address: endpoint,
                interface: number,
                alt_setting,
                transfer_type,
                max_packet_size,
                interval: ep.interval(),
                companion,
                packet_size,
            };
            info!("Located {}", info);
            return Ok(info);
        }

        Err(DeviceError::EndpointNotFound(endpoint))
    }

    fn claim(&mut self, interface: u8) -> Result<(), DeviceError> {
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                if let Err(e) = self.handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        self.handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            DeviceError::Usb(e)
        })?;
        debug!("Claimed interface {}", interface);
        self.claimed.push(interface);
        Ok(())
    }

    fn release(&mut self, interface: u8) {
        if let Err(e) = self.handle.release_interface(interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
        if self.handle.attach_kernel_driver(interface).is_ok() {
            debug!("Reattached kernel driver to interface {}", interface);
        }
        self.claimed.retain(|&claimed| claimed != interface);
    }
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        for interface in std::mem::take(&mut self.claimed) {
            self.release(interface);
        }
        debug!("Closed {}", self.summary);
    }
}
