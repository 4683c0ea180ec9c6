//! Device enumeration (spec.md §4.A): filter attached serial ports by the
//! EBB's USB vendor/product id, by manufacturer substring, or by a
//! previously-recorded nickname.

use serialport::SerialPortType;

/// EBB USB vendor/product id (04D8:FD92).
pub const EBB_VID: u16 = 0x04D8;
pub const EBB_PID: u16 = 0xFD92;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveredPort {
    pub path: String,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

/// Enumerate serial ports that look like an EBB: matching VID/PID, or
/// whose manufacturer string contains "EiBotBoard" (some bootloaders and
/// clones report only the manufacturer string).
pub fn discover_ebb_ports() -> Vec<DiscoveredPort> {
    let ports = match serialport::available_ports() {
        Ok(p) => p,
        Err(_) => return Vec::new(),
    };

    ports
        .into_iter()
        .filter_map(|p| {
            let SerialPortType::UsbPort(info) = &p.port_type else {
                return None;
            };
            let manufacturer = info.manufacturer.clone();
            let is_ebb_vid_pid = info.vid == EBB_VID && info.pid == EBB_PID;
            let is_ebb_manufacturer = manufacturer
                .as_deref()
                .map(|m| m.to_lowercase().contains("eibotboard"))
                .unwrap_or(false);

            if is_ebb_vid_pid || is_ebb_manufacturer {
                Some(DiscoveredPort {
                    path: p.port_name,
                    manufacturer,
                    serial_number: info.serial_number.clone(),
                })
            } else {
                None
            }
        })
        .collect()
}

/// Find a previously-discovered port whose serial-number field matches a
/// device nickname (the device persists its nickname via `ST`/`QT`, but
/// some OS drivers mirror it into the USB serial-number descriptor).
pub fn find_by_nickname(nickname: &str) -> Option<DiscoveredPort> {
    discover_ebb_ports()
        .into_iter()
        .find(|p| p.serial_number.as_deref() == Some(nickname))
}
