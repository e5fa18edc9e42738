//! USB/IP wire format: big-endian, bit-exact with Linux vhci-hcd's
//! userspace protocol. Grounded on
//! `original_source/not_my_board/_usbip.py`'s `_UsbIpConnection` and
//! `_StructBuilder`, generalized per spec.md §4.3.

use std::io;

pub const PROTOCOL_VERSION: u16 = 0x0111;
pub const COMMAND_CODE_IMPORT_REQUEST: u16 = 0x8003;
pub const COMMAND_CODE_IMPORT_REPLY: u16 = 0x0003;
pub const COMMAND_CODE_DEVLIST_REQUEST: u16 = 0x8005;
pub const COMMAND_CODE_DEVLIST_REPLY: u16 = 0x0005;

const BUSID_SIZE: usize = 32;
const PATH_SIZE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected protocol version: {0:#06x}")]
    UnexpectedVersion(u16),
    #[error("unexpected status: {0}")]
    UnexpectedStatus(u32),
    #[error("unexpected command code: {0:#06x}")]
    UnexpectedCommand(u16),
    #[error("unexpected bus id: {0:?}")]
    UnexpectedBusId(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl Header {
    pub const SIZE: usize = 8;

    pub fn new(code: u16) -> Self {
        Self { version: PROTOCOL_VERSION, code, status: 0 }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.code.to_be_bytes());
        buf[4..8].copy_from_slice(&self.status.to_be_bytes());
        buf
    }

    /// Decodes and validates version/status, per spec.md §4.3: "Any message
    /// with an unexpected version or non-zero status... fails with
    /// ProtocolError".
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::Malformed("short header".into()));
        }
        let header = Header {
            version: u16::from_be_bytes([buf[0], buf[1]]),
            code: u16::from_be_bytes([buf[2], buf[3]]),
            status: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        };
        if header.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnexpectedVersion(header.version));
        }
        if header.status != 0 {
            return Err(ProtocolError::UnexpectedStatus(header.status));
        }
        Ok(header)
    }
}

fn encode_fixed(s: &str, size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    let bytes = s.as_bytes();
    let n = bytes.len().min(size);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn decode_fixed(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// The fixed-layout device descriptor shared by import and devlist replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceDesc {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl UsbDeviceDesc {
    pub const SIZE: usize = PATH_SIZE + BUSID_SIZE + 4 + 4 + 4 + 2 + 2 + 2 + 1 + 1 + 1 + 1 + 1 + 1;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&encode_fixed(&self.path, PATH_SIZE));
        buf.extend_from_slice(&encode_fixed(&self.busid, BUSID_SIZE));
        buf.extend_from_slice(&self.busnum.to_be_bytes());
        buf.extend_from_slice(&self.devnum.to_be_bytes());
        buf.extend_from_slice(&self.speed.to_be_bytes());
        buf.extend_from_slice(&self.id_vendor.to_be_bytes());
        buf.extend_from_slice(&self.id_product.to_be_bytes());
        buf.extend_from_slice(&self.bcd_device.to_be_bytes());
        buf.push(self.device_class);
        buf.push(self.device_sub_class);
        buf.push(self.device_protocol);
        buf.push(self.configuration_value);
        buf.push(self.num_configurations);
        buf.push(self.num_interfaces);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::Malformed("short device descriptor".into()));
        }
        let mut off = 0;
        macro_rules! take {
            ($n:expr) => {{
                let slice = &buf[off..off + $n];
                off += $n;
                slice
            }};
        }
        let path = decode_fixed(take!(PATH_SIZE));
        let busid = decode_fixed(take!(BUSID_SIZE));
        let busnum = u32::from_be_bytes(take!(4).try_into().unwrap());
        let devnum = u32::from_be_bytes(take!(4).try_into().unwrap());
        let speed = u32::from_be_bytes(take!(4).try_into().unwrap());
        let id_vendor = u16::from_be_bytes(take!(2).try_into().unwrap());
        let id_product = u16::from_be_bytes(take!(2).try_into().unwrap());
        let bcd_device = u16::from_be_bytes(take!(2).try_into().unwrap());
        let device_class = take!(1)[0];
        let device_sub_class = take!(1)[0];
        let device_protocol = take!(1)[0];
        let configuration_value = take!(1)[0];
        let num_configurations = take!(1)[0];
        let num_interfaces = take!(1)[0];

        Ok(Self {
            path,
            busid,
            busnum,
            devnum,
            speed,
            id_vendor,
            id_product,
            bcd_device,
            device_class,
            device_sub_class,
            device_protocol,
            configuration_value,
            num_configurations,
            num_interfaces,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub busid: String,
}

impl ImportRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Header::new(COMMAND_CODE_IMPORT_REQUEST).encode().to_vec();
        buf.extend_from_slice(&encode_fixed(&self.busid, BUSID_SIZE));
        buf
    }

    pub fn decode_body(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < BUSID_SIZE {
            return Err(ProtocolError::Malformed("short import request".into()));
        }
        Ok(Self { busid: decode_fixed(&buf[..BUSID_SIZE]) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReply {
    pub device: UsbDeviceDesc,
}

impl ImportReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Header::new(COMMAND_CODE_IMPORT_REPLY).encode().to_vec();
        buf.extend_from_slice(&self.device.encode());
        buf
    }

    pub fn decode_body(buf: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self { device: UsbDeviceDesc::decode(buf)? })
    }
}

/// A request the server can receive after the common header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingRequest {
    Import(ImportRequest),
    DevlistRequest,
}

/// Reads the header and dispatches on its code, per spec.md §4.3: "Any...
/// reply code where a request was expected... fails with ProtocolError".
pub fn decode_request(header: Header, body: &[u8]) -> Result<IncomingRequest, ProtocolError> {
    match header.code {
        COMMAND_CODE_IMPORT_REQUEST => Ok(IncomingRequest::Import(ImportRequest::decode_body(body)?)),
        COMMAND_CODE_DEVLIST_REQUEST => Ok(IncomingRequest::DevlistRequest),
        other => Err(ProtocolError::UnexpectedCommand(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_desc() -> UsbDeviceDesc {
        UsbDeviceDesc {
            path: "/sys/bus/usb/devices/1-3".into(),
            busid: "1-3".into(),
            busnum: 1,
            devnum: 3,
            speed: 3,
            id_vendor: 0x1d6b,
            id_product: 0x0002,
            bcd_device: 0x0100,
            device_class: 0x09,
            device_sub_class: 0,
            device_protocol: 1,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
        }
    }

    #[test]
    fn device_desc_round_trips() {
        let desc = sample_desc();
        let bytes = desc.encode();
        assert_eq!(bytes.len(), UsbDeviceDesc::SIZE);
        assert_eq!(UsbDeviceDesc::decode(&bytes).unwrap(), desc);
    }

    #[test]
    fn import_request_round_trips() {
        let req = ImportRequest { busid: "1-3.2".into() };
        let bytes = req.encode();
        let header = Header::decode(&bytes[..Header::SIZE]).unwrap();
        assert_eq!(header.code, COMMAND_CODE_IMPORT_REQUEST);
        let decoded = ImportRequest::decode_body(&bytes[Header::SIZE..]).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn import_reply_round_trips() {
        let reply = ImportReply { device: sample_desc() };
        let bytes = reply.encode();
        let header = Header::decode(&bytes[..Header::SIZE]).unwrap();
        assert_eq!(header.code, COMMAND_CODE_IMPORT_REPLY);
        let decoded = ImportReply::decode_body(&bytes[Header::SIZE..]).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn header_rejects_wrong_version_and_nonzero_status() {
        let mut bytes = Header::new(COMMAND_CODE_IMPORT_REQUEST).encode();
        bytes[0] = 0x02; // corrupt version high byte
        assert!(matches!(Header::decode(&bytes), Err(ProtocolError::UnexpectedVersion(_))));

        let mut bytes = Header::new(COMMAND_CODE_IMPORT_REQUEST).encode();
        bytes[7] = 1; // nonzero status
        assert!(matches!(Header::decode(&bytes), Err(ProtocolError::UnexpectedStatus(_))));
    }

    #[test]
    fn busid_is_nul_padded_and_trimmed_on_decode() {
        let req = ImportRequest { busid: "1-2".into() };
        let body = &req.encode()[Header::SIZE..];
        assert_eq!(body.len(), BUSID_SIZE);
        assert!(body[3..].iter().all(|&b| b == 0));
    }
}
