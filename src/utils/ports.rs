/// Return a sorted list of available ports as (port_name, port_type_string).
pub fn enumerate_ports() -> Vec<(String, String)> {
    let mut ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            log::warn!("Failed to enumerate serial ports: {err}");
            Vec::new()
        }
    };
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    ports
        .into_iter()
        .map(|p| {
            let kind = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => format!(
                    "USB {:04x}:{:04x}{}",
                    info.vid,
                    info.pid,
                    info.product
                        .map(|product| format!(" ({product})"))
                        .unwrap_or_default()
                ),
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::Unknown => "Unknown".to_string(),
            };
            (p.port_name, kind)
        })
        .collect()
}
