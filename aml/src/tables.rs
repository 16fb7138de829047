use crate::{owner::OwnerId, AmlError};
use alloc::{sync::Arc, vec::Vec};
use bit_field::BitField;
use byteorder::{ByteOrder, LittleEndian};
use core::{fmt, str};
use log::trace;

pub const SDT_HEADER_LENGTH: usize = 36;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub const DSDT: Signature = Signature(*b"DSDT");
    pub const SSDT: Signature = Signature(*b"SSDT");
    pub const PSDT: Signature = Signature(*b"PSDT");
    pub const OSDT: Signature = Signature(*b"OSDT");
    pub const FADT: Signature = Signature(*b"FACP");

    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Whether tables with this signature contain AML.
    pub fn is_aml(&self) -> bool {
        matches!(*self, Signature::DSDT | Signature::SSDT | Signature::PSDT | Signature::OSDT)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.as_str())
    }
}

/// All SDTs share the same header, and are `length` bytes long. The signature tells us which SDT this is.
#[derive(Clone, Copy, Debug)]
pub struct SdtHeader {
    pub signature: Signature,
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

impl SdtHeader {
    /// Decode the header at the start of `bytes`. This checks that the table is at least as long as it claims
    /// to be, and that the signature is made of printable characters, but does not check the checksum.
    pub fn parse(bytes: &[u8]) -> Result<SdtHeader, AmlError> {
        if bytes.len() < SDT_HEADER_LENGTH {
            return Err(AmlError::TableTruncated);
        }

        let signature = Signature([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if !signature.0.iter().all(|&c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == b'_') {
            return Err(AmlError::TableInvalidSignature);
        }

        let length = LittleEndian::read_u32(&bytes[4..8]);
        if (length as usize) < SDT_HEADER_LENGTH || (length as usize) > bytes.len() {
            return Err(AmlError::TableTruncated);
        }

        let mut oem_id = [0u8; 6];
        oem_id.copy_from_slice(&bytes[10..16]);
        let mut oem_table_id = [0u8; 8];
        oem_table_id.copy_from_slice(&bytes[16..24]);

        Ok(SdtHeader {
            signature,
            length,
            revision: bytes[8],
            checksum: bytes[9],
            oem_id,
            oem_table_id,
            oem_revision: LittleEndian::read_u32(&bytes[24..28]),
            creator_id: LittleEndian::read_u32(&bytes[28..32]),
            creator_revision: LittleEndian::read_u32(&bytes[32..36]),
        })
    }

    pub fn oem_id(&self) -> &str {
        str::from_utf8(&self.oem_id).unwrap_or("")
    }

    pub fn oem_table_id(&self) -> &str {
        str::from_utf8(&self.oem_table_id).unwrap_or("")
    }
}

/// Check that every byte of the table sums to zero.
pub fn validate_checksum(signature: Signature, table: &[u8]) -> Result<(), AmlError> {
    let sum = table.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte));
    if sum != 0 {
        return Err(AmlError::TableInvalidChecksum(signature));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TableIndex(pub(crate) usize);

impl TableIndex {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TableOrigin {
    /// Bytes handed to us by the host.
    ExternalVirtual,
    /// Found by us at a physical address. The host mapping of the table is kept while it is installed, and the
    /// table is re-read through it when it is loaded.
    InternalPhysical,
    /// An owned copy of a table made by us (e.g. for `copy_dsdt_locally`, or a table loaded from a buffer by
    /// `Load`). Later changes to the memory it came from are not seen.
    InternalVirtual,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TableMapping {
    pub virtual_address: usize,
    pub length: usize,
}

pub struct TableDescriptor {
    pub header: SdtHeader,
    pub data: Arc<[u8]>,
    pub origin: TableOrigin,
    pub physical_address: Option<u64>,
    pub mapping: Option<TableMapping>,
    pub validated: bool,
    pub loaded: bool,
    pub owner: OwnerId,
}

impl TableDescriptor {
    pub fn new(data: Arc<[u8]>, origin: TableOrigin, physical_address: Option<u64>) -> Result<TableDescriptor, AmlError> {
        let header = SdtHeader::parse(&data)?;
        validate_checksum(header.signature, &data[0..header.length as usize])?;

        Ok(TableDescriptor {
            header,
            data,
            origin,
            physical_address,
            mapping: None,
            validated: true,
            loaded: false,
            owner: OwnerId::NONE,
        })
    }

    pub fn signature(&self) -> Signature {
        self.header.signature
    }

    /// The AML body of the table, after the header.
    pub fn body_range(&self) -> (usize, usize) {
        (SDT_HEADER_LENGTH, self.header.length as usize)
    }
}

/// The tables that have been installed, in installation order. Tables are never removed from the list, so a
/// `TableIndex` stays valid; unloading only clears the `loaded` flag.
pub struct TableList {
    tables: Vec<TableDescriptor>,
}

impl TableList {
    pub fn new() -> TableList {
        TableList { tables: Vec::new() }
    }

    /// Add a table to the list. If an identical table is already installed, its index is returned instead.
    pub fn install(&mut self, descriptor: TableDescriptor) -> TableIndex {
        if let Some(existing) = self
            .tables
            .iter()
            .position(|table| table.signature() == descriptor.signature() && table.data[..] == descriptor.data[..])
        {
            trace!("Table {} is already installed at index {}", descriptor.signature(), existing);
            return TableIndex(existing);
        }

        self.tables.push(descriptor);
        TableIndex(self.tables.len() - 1)
    }

    pub fn get(&self, index: TableIndex) -> Result<&TableDescriptor, AmlError> {
        self.tables.get(index.0).ok_or(AmlError::InvalidHandle)
    }

    pub fn get_mut(&mut self, index: TableIndex) -> Result<&mut TableDescriptor, AmlError> {
        self.tables.get_mut(index.0).ok_or(AmlError::InvalidHandle)
    }

    /// Find the `instance`th installed table with the given signature.
    pub fn find(&self, signature: Signature, instance: usize) -> Option<TableIndex> {
        self.tables
            .iter()
            .enumerate()
            .filter(|(_, table)| table.signature() == signature)
            .nth(instance)
            .map(|(index, _)| TableIndex(index))
    }

    /// Find a table by signature and OEM ids, as done by `LoadTable`. Empty OEM ids match anything.
    pub fn find_by_oem(&self, signature: Signature, oem_id: &str, oem_table_id: &str) -> Option<TableIndex> {
        self.tables
            .iter()
            .position(|table| {
                table.signature() == signature
                    && (oem_id.is_empty() || table.header.oem_id().trim_end_matches('\0') == oem_id)
                    && (oem_table_id.is_empty() || table.header.oem_table_id().trim_end_matches('\0') == oem_table_id)
            })
            .map(TableIndex)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableIndex, &TableDescriptor)> {
        self.tables.iter().enumerate().map(|(index, table)| (TableIndex(index), table))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Default for TableList {
    fn default() -> Self {
        TableList::new()
    }
}

/// The fields of the FADT that the AML engine cares about.
#[derive(Clone, Copy, Debug)]
pub struct Fadt {
    pub revision: u8,
    pub minor_version: u8,
    pub flags: u32,
    pub dsdt_address: u32,
    pub x_dsdt_address: u64,
}

impl Fadt {
    const DSDT_OFFSET: usize = 40;
    const FLAGS_OFFSET: usize = 112;
    const MINOR_VERSION_OFFSET: usize = 131;
    const X_DSDT_OFFSET: usize = 140;
    const HW_REDUCED_ACPI: usize = 20;

    pub fn parse(bytes: &[u8]) -> Result<Fadt, AmlError> {
        let header = SdtHeader::parse(bytes)?;
        if header.signature != Signature::FADT {
            return Err(AmlError::TableInvalidSignature);
        }
        validate_checksum(header.signature, &bytes[0..header.length as usize])?;
        let bytes = &bytes[0..header.length as usize];

        // Older FADTs are shorter, and fields past their end read as zero
        let read_u32 = |offset: usize| bytes.get(offset..offset + 4).map(LittleEndian::read_u32).unwrap_or(0);
        let read_u64 = |offset: usize| bytes.get(offset..offset + 8).map(LittleEndian::read_u64).unwrap_or(0);

        Ok(Fadt {
            revision: header.revision,
            minor_version: bytes.get(Self::MINOR_VERSION_OFFSET).copied().unwrap_or(0),
            flags: read_u32(Self::FLAGS_OFFSET),
            dsdt_address: read_u32(Self::DSDT_OFFSET),
            x_dsdt_address: read_u64(Self::X_DSDT_OFFSET),
        })
    }

    pub fn is_hardware_reduced(&self) -> bool {
        self.flags.get_bit(Self::HW_REDUCED_ACPI)
    }

    /// Check that the platform is hardware-reduced and describes itself with at least ACPI 6.5.
    pub fn check_hardware_reduced(&self) -> Result<(), AmlError> {
        if (self.revision, self.minor_version) < (6, 5) {
            return Err(AmlError::TableUnsupportedRevision);
        }
        if !self.is_hardware_reduced() {
            return Err(AmlError::HardwareReducedRequired);
        }
        Ok(())
    }

    /// The physical address of the DSDT. `X_DSDT` is preferred unless it is zero or the host asked us not to
    /// use it.
    pub fn dsdt_address(&self, do_not_use_xsdt: bool) -> u64 {
        if self.x_dsdt_address != 0 && !do_not_use_xsdt {
            self.x_dsdt_address
        } else {
            self.dsdt_address as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_fadt, make_table};

    #[test]
    fn header_and_checksum() {
        let table = make_table(b"SSDT", 2, &[0xa4, 0x00]);
        let header = SdtHeader::parse(&table).unwrap();
        assert_eq!(header.signature, Signature::SSDT);
        assert_eq!(header.length as usize, SDT_HEADER_LENGTH + 2);
        assert_eq!(header.revision, 2);
        assert!(validate_checksum(header.signature, &table).is_ok());

        let mut corrupted = table.clone();
        corrupted[SDT_HEADER_LENGTH] ^= 0xff;
        assert_eq!(validate_checksum(header.signature, &corrupted), Err(AmlError::TableInvalidChecksum(Signature::SSDT)));

        assert_eq!(SdtHeader::parse(&table[0..20]).err(), Some(AmlError::TableTruncated));
        assert_eq!(SdtHeader::parse(&table[0..37]).err(), Some(AmlError::TableTruncated));

        let mut bad_signature = table.clone();
        bad_signature[0] = 0x01;
        assert_eq!(SdtHeader::parse(&bad_signature).err(), Some(AmlError::TableInvalidSignature));
    }

    #[test]
    fn duplicate_tables_share_an_index() {
        let mut list = TableList::new();
        let table: Arc<[u8]> = make_table(b"SSDT", 2, &[0xa3]).into();
        let first = list.install(TableDescriptor::new(table.clone(), TableOrigin::ExternalVirtual, None).unwrap());
        let second = list.install(TableDescriptor::new(table, TableOrigin::ExternalVirtual, None).unwrap());
        assert_eq!(first, second);

        let other: Arc<[u8]> = make_table(b"SSDT", 2, &[0xa3, 0xa3]).into();
        let third = list.install(TableDescriptor::new(other, TableOrigin::ExternalVirtual, None).unwrap());
        assert_ne!(first, third);
        assert_eq!(list.find(Signature::SSDT, 1), Some(third));
        assert_eq!(list.find(Signature::DSDT, 0), None);
    }

    #[test]
    fn fadt_fields() {
        let fadt = Fadt::parse(&make_fadt(6, 5, true, 0x1000, 0x2_0000_0000)).unwrap();
        assert!(fadt.is_hardware_reduced());
        assert_eq!(fadt.check_hardware_reduced(), Ok(()));
        assert_eq!(fadt.dsdt_address(false), 0x2_0000_0000);
        assert_eq!(fadt.dsdt_address(true), 0x1000);

        let old = Fadt::parse(&make_fadt(6, 4, true, 0x1000, 0)).unwrap();
        assert_eq!(old.check_hardware_reduced(), Err(AmlError::TableUnsupportedRevision));
        assert_eq!(old.dsdt_address(false), 0x1000);

        let full = Fadt::parse(&make_fadt(6, 5, false, 0x1000, 0)).unwrap();
        assert_eq!(full.check_hardware_reduced(), Err(AmlError::HardwareReducedRequired));
    }
}
