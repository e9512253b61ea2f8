//! Node API messages
//!
//! The subset of the machine and storage service protocol this crate calls,
//! written with `prost` derives. Field numbers match the node's protocol
//! definitions; fields we never read are omitted and skipped on decode.

#![allow(missing_docs)]

/// Unary and streaming method paths
pub mod paths {
    pub const BOOTSTRAP: &str = "/machine.MachineService/Bootstrap";
    pub const APPLY_CONFIGURATION: &str = "/machine.MachineService/ApplyConfiguration";
    pub const KUBECONFIG: &str = "/machine.MachineService/Kubeconfig";
    pub const DISKS: &str = "/storage.StorageService/Disks";
}

/// gRPC metadata key naming the node a request is proxied to
pub const NODE_METADATA_KEY: &str = "node";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

/// Per-node response envelope
#[derive(Clone, PartialEq, prost::Message)]
pub struct Metadata {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Chunk of a streamed payload
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    #[prost(bytes = "vec", tag = "2")]
    pub bytes: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BootstrapRequest {
    #[prost(bool, tag = "1")]
    pub recover_etcd: bool,
    #[prost(bool, tag = "2")]
    pub recover_skip_hash_check: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Bootstrap {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BootstrapResponse {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Bootstrap>,
}

/// Apply mode on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ApplyConfigurationMode {
    Reboot = 0,
    Auto = 1,
    NoReboot = 2,
    Staged = 3,
    Try = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplyConfigurationRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(enumeration = "ApplyConfigurationMode", tag = "4")]
    pub mode: i32,
    #[prost(bool, tag = "5")]
    pub dry_run: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplyConfiguration {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    #[prost(string, repeated, tag = "2")]
    pub warnings: Vec<String>,
    #[prost(enumeration = "ApplyConfigurationMode", tag = "3")]
    pub mode: i32,
    #[prost(string, tag = "4")]
    pub mode_details: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplyConfigurationResponse {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<ApplyConfiguration>,
}

/// Disk medium on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DiskType {
    Unknown = 0,
    Ssd = 1,
    Hdd = 2,
    Nvme = 3,
    Sd = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Disk {
    #[prost(uint64, tag = "1")]
    pub size: u64,
    #[prost(string, tag = "2")]
    pub model: String,
    #[prost(string, tag = "3")]
    pub device_name: String,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(string, tag = "5")]
    pub serial: String,
    #[prost(string, tag = "6")]
    pub modalias: String,
    #[prost(string, tag = "7")]
    pub uuid: String,
    #[prost(string, tag = "8")]
    pub wwid: String,
    #[prost(enumeration = "DiskType", tag = "9")]
    pub r#type: i32,
    #[prost(string, tag = "10")]
    pub bus_path: String,
    #[prost(bool, tag = "11")]
    pub system_disk: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Disks {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    #[prost(message, repeated, tag = "2")]
    pub disks: Vec<Disk>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DisksResponse {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Disks>,
}

impl From<crate::node::ApplyMode> for ApplyConfigurationMode {
    fn from(mode: crate::node::ApplyMode) -> Self {
        use crate::node::ApplyMode;
        match mode {
            ApplyMode::Auto => Self::Auto,
            ApplyMode::Reboot => Self::Reboot,
            ApplyMode::NoReboot => Self::NoReboot,
            ApplyMode::Staged => Self::Staged,
            ApplyMode::Try => Self::Try,
        }
    }
}

impl From<ApplyConfigurationMode> for crate::node::ApplyMode {
    fn from(mode: ApplyConfigurationMode) -> Self {
        match mode {
            ApplyConfigurationMode::Auto => Self::Auto,
            ApplyConfigurationMode::Reboot => Self::Reboot,
            ApplyConfigurationMode::NoReboot => Self::NoReboot,
            ApplyConfigurationMode::Staged => Self::Staged,
            ApplyConfigurationMode::Try => Self::Try,
        }
    }
}

impl From<Disk> for crate::disk::DiskRecord {
    fn from(disk: Disk) -> Self {
        use crate::disk::DiskType as Medium;

        let disk_type = match DiskType::try_from(disk.r#type) {
            Ok(DiskType::Ssd) => Some(Medium::Ssd),
            Ok(DiskType::Hdd) => Some(Medium::Hdd),
            Ok(DiskType::Nvme) => Some(Medium::Nvme),
            Ok(DiskType::Sd) => Some(Medium::Sd),
            Ok(DiskType::Unknown) | Err(_) => None,
        };

        // Older nodes only fill `device_name`.
        let name = if disk.device_name.is_empty() {
            disk.name
        } else {
            disk.device_name
        };

        Self {
            size: disk.size,
            name,
            model: disk.model,
            serial: disk.serial,
            modalias: disk.modalias,
            uuid: disk.uuid,
            wwid: disk.wwid,
            disk_type,
            bus_path: disk.bus_path,
            system_disk: disk.system_disk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn apply_request_uses_wire_field_numbers() {
        let request = ApplyConfigurationRequest {
            data: b"version: v1alpha1".to_vec(),
            mode: ApplyConfigurationMode::NoReboot as i32,
            dry_run: true,
        };
        let bytes = request.encode_to_vec();

        // field 4 varint (0x20) = 2, field 5 varint (0x28) = 1
        assert!(bytes.windows(2).any(|w| w == [0x20, 0x02]));
        assert!(bytes.windows(2).any(|w| w == [0x28, 0x01]));
    }

    #[test]
    fn disk_converts_to_record() {
        let disk = Disk {
            size: 10_000_000_000,
            device_name: "/dev/nvme0n1".to_string(),
            name: "nvme0n1".to_string(),
            r#type: DiskType::Nvme as i32,
            ..Default::default()
        };
        let record = crate::disk::DiskRecord::from(disk);
        assert_eq!(record.name, "/dev/nvme0n1");
        assert_eq!(record.disk_type, Some(crate::disk::DiskType::Nvme));

        let unknown = crate::disk::DiskRecord::from(Disk {
            r#type: 42,
            ..Default::default()
        });
        assert_eq!(unknown.disk_type, None);
    }

    #[test]
    fn apply_modes_map_both_ways() {
        for mode in [
            crate::node::ApplyMode::Auto,
            crate::node::ApplyMode::Reboot,
            crate::node::ApplyMode::NoReboot,
            crate::node::ApplyMode::Staged,
            crate::node::ApplyMode::Try,
        ] {
            let wire = ApplyConfigurationMode::from(mode);
            assert_eq!(crate::node::ApplyMode::from(wire), mode);
        }
    }
}
