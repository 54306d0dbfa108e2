//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        device::{DetectedPort, sort_ports},
        error::{Error, Result},
        port::{Port, PortOpener, SerialConfig},
    },
    log::{debug, trace},
    std::io::{Read, Write},
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    baud_rate: u32,
}

impl NativePort {
    /// Open a serial port with the given configuration (8N1, no flow control).
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Self {
            port: Some(port),
            name: config
                .port_name
                .clone(),
            baud_rate: config.baud_rate,
        })
    }

    fn closed_error() -> Error {
        Error::Serial(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "Port is closed",
        ))
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        let p = self
            .port
            .as_mut()
            .ok_or_else(Self::closed_error)?;
        p.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("Setting RTS to {level}");
        let p = self
            .port
            .as_mut()
            .ok_or_else(Self::closed_error)?;
        p.write_request_to_send(level)?;
        Ok(())
    }

    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>> {
        let p = self
            .port
            .as_ref()
            .ok_or_else(Self::closed_error)?;
        Ok(Box::new(p.try_clone()?))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the boxed handle closes the file descriptor
        self.port
            .take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

/// Opens [`NativePort`] handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePortOpener;

impl PortOpener for NativePortOpener {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        debug!(
            "Opening {} at {} baud",
            config.port_name, config.baud_rate
        );
        Ok(Box::new(NativePort::open(config)?))
    }
}

/// Enumerate ports through the operating system instead of the build tool.
pub fn list_native_ports() -> Result<Vec<DetectedPort>> {
    let ports = serialport::available_ports().map_err(Error::Serial)?;

    let mut result: Vec<DetectedPort> = ports
        .into_iter()
        .map(|p| match p.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                trace!(
                    "Found USB port: {} (VID: {:04X}, PID: {:04X})",
                    p.port_name, usb.vid, usb.pid
                );
                let mut detected =
                    DetectedPort::new(p.port_name, "serial", Some((usb.vid, usb.pid)));
                if detected.manufacturer.is_none() {
                    detected.manufacturer = usb.manufacturer;
                }
                detected.product = usb.product;
                detected.serial_number = usb.serial_number;
                detected
            },
            _ => DetectedPort::new(p.port_name, "serial", None),
        })
        .collect();

    sort_ports(&mut result);
    Ok(result)
}
