use calypso_apdu_core::{Command, Response};
use iso7816_tlv::ber::{Tag, Tlv, Value};
use tracing::debug;

use super::{CardCommand, CommandOutput, CommandRef};
use crate::card::{CardClass, DirectoryHeader, EfType, FileHeader};
use crate::constants::{
    PROPRIETARY_INFORMATION_LENGTH, TAG_PROPRIETARY_INFORMATION, file_type, ins, sel,
};
use crate::context::CommandContext;
use crate::error::{CommandFailure, Error};
use crate::status::{ErrorKind, StatusEntry, StatusTable};

const STATUS_TABLE: StatusTable = &[
    StatusEntry::failure(0x6700, "Lc value not supported", ErrorKind::IllegalParameter),
    StatusEntry::failure(0x6A82, "File not found", ErrorKind::CardDataAccess),
    StatusEntry::success(0x6119, "Correct execution (ISO7816 T=0)"),
];

/// File entered by a Select File
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectedFile {
    /// Master or dedicated file
    Directory(DirectoryHeader),
    /// Elementary file
    File(FileHeader),
}

/// Select File command, by logical identifier
#[derive(Debug, Clone)]
pub struct SelectFileCommand {
    request: Command,
    lid: u16,
}

impl SelectFileCommand {
    /// Select the file with logical identifier `lid`
    pub fn by_lid(class: CardClass, lid: u16) -> Self {
        Self {
            request: Command::new_with_data_and_le(
                class.cla(),
                ins::SELECT_FILE,
                class.select_by_lid_p1(),
                0x00,
                lid.to_be_bytes().to_vec(),
                0x00,
            ),
            lid,
        }
    }

    /// Logical identifier requested
    pub const fn lid(&self) -> u16 {
        self.lid
    }
}

/// Look for the proprietary information, at any depth of the FCI
fn find_proprietary_information(tlvs: &[Tlv], tag: &Tag) -> Option<Vec<u8>> {
    tlvs.iter().find_map(|tlv| match tlv.value() {
        Value::Primitive(bytes) if tlv.tag() == tag => Some(bytes.clone()),
        Value::Constructed(inner) => find_proprietary_information(inner, tag),
        Value::Primitive(_) => None,
    })
}

fn word(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn decode(info: &[u8]) -> Result<SelectedFile, Error> {
    let failure =
        |message| Error::CardDataAccess(CommandFailure::local(CommandRef::SelectFile, message));
    match info[sel::TYPE] {
        file_type::MF | file_type::DF => Ok(SelectedFile::Directory(DirectoryHeader {
            lid: word(info, sel::LID),
            access_conditions: array(info, sel::AC),
            key_indexes: array(info, sel::NKEY),
            df_status: info[sel::DF_STATUS],
            kvcs: array(info, sel::KVCS),
            kifs: array(info, sel::KIFS),
        })),
        file_type::EF => {
            let ef_type = EfType::from_card_value(info[sel::EF_TYPE])
                .ok_or_else(|| failure("Unknown EF type"))?;
            let (record_size, records_number) = match ef_type {
                EfType::Binary => (
                    (usize::from(info[sel::REC_SIZE]) << 8) | usize::from(info[sel::NUM_REC]),
                    1,
                ),
                _ => (usize::from(info[sel::REC_SIZE]), usize::from(info[sel::NUM_REC])),
            };
            Ok(SelectedFile::File(FileHeader {
                lid: word(info, sel::LID),
                sfi: info[sel::SFI],
                ef_type,
                record_size,
                records_number,
                access_conditions: array::<{ sel::AC_LENGTH }>(info, sel::AC),
                key_indexes: array::<{ sel::NKEY_LENGTH }>(info, sel::NKEY),
                df_status: info[sel::DF_STATUS],
                shared_reference: word(info, sel::DATA_REF),
            }))
        }
        _ => Err(failure("Unknown file type")),
    }
}

impl CardCommand for SelectFileCommand {
    fn command_ref(&self) -> CommandRef {
        CommandRef::SelectFile
    }

    fn request(&self) -> &Command {
        &self.request
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    fn parse_response(
        &mut self,
        ctx: &mut CommandContext<'_>,
        response: &Response,
    ) -> Result<CommandOutput, Error> {
        let tag = Tag::try_from(TAG_PROPRIETARY_INFORMATION).map_err(|_| {
            Error::unexpected_length(CommandRef::SelectFile, "Invalid proprietary information tag")
        })?;
        let info = find_proprietary_information(&Tlv::parse_all(response.payload()), &tag)
            .filter(|info| info.len() == PROPRIETARY_INFORMATION_LENGTH)
            .ok_or_else(|| {
                Error::unexpected_length(
                    CommandRef::SelectFile,
                    "Proprietary information missing or malformed",
                )
            })?;

        let selected = decode(&info)?;
        let transaction = &mut *ctx.transaction;
        match &selected {
            SelectedFile::Directory(header) => {
                debug!(lid = format_args!("{:04X}", header.lid), "Directory selected");
                transaction.directory = Some(header.clone());
                transaction.file_headers.clear();
                transaction.records.clear();
            }
            SelectedFile::File(header) => {
                debug!(lid = format_args!("{:04X}", header.lid), sfi = header.sfi, "File selected");
                transaction.file_headers.insert(header.sfi, header.clone());
            }
        }
        Ok(CommandOutput::Selected(selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCapacity;
    use crate::card::{CalypsoCard, WriteAccessLevel};
    use crate::context::TransactionContext;
    use bytes::Bytes;
    use hex_literal::hex;

    // FCI template wrapping the proprietary information of a DF
    const DF_FCI: [u8; 27] = hex!(
        "6F19 8517"
        "00 02 00 00 00 10101010 01020300 00 7E7D7C 2B2C2D 00 2000"
    );

    // Proprietary information of a linear EF, sfi 07, 3 records of 29 bytes
    const EF_FCI: [u8; 25] = hex!(
        "8517"
        "07 04 02 1D 03 1F101010 01010101 00 0000 000000 0000 2010"
    );

    fn context() -> TransactionContext {
        TransactionContext::new(CalypsoCard::new(vec![0x01; 8], BufferCapacity::bytes(430)))
    }

    #[test]
    fn test_request_bytes() {
        let iso = SelectFileCommand::by_lid(CardClass::Iso, 0x2010);
        assert_eq!(iso.request().to_bytes().as_ref(), hex!("00A4090002201000"));

        let legacy = SelectFileCommand::by_lid(CardClass::Legacy, 0x2000);
        assert_eq!(legacy.request().to_bytes().as_ref(), hex!("94A4080002200000"));
    }

    #[test]
    fn test_select_directory_clears_cache() {
        let mut ctx = context();
        ctx.records.set(0x07, 1, Bytes::from_static(&hex!("AA")));
        let mut cmd = SelectFileCommand::by_lid(CardClass::Iso, 0x2000);
        let response = Response::success(DF_FCI.to_vec());

        let output = cmd
            .parse_response(&mut CommandContext::new(&mut ctx), &response)
            .unwrap();
        let CommandOutput::Selected(SelectedFile::Directory(header)) = output else {
            panic!("unexpected output");
        };
        assert_eq!(header.lid, 0x2000);
        assert_eq!(header.kvc(WriteAccessLevel::Load), 0x7D);
        assert_eq!(header.kif(WriteAccessLevel::Debit), 0x2D);
        assert!(ctx.records().is_empty());
        assert!(ctx.directory().is_some());
    }

    #[test]
    fn test_select_elementary_file() {
        let mut ctx = context();
        let mut cmd = SelectFileCommand::by_lid(CardClass::Iso, 0x2010);
        let response = Response::success(EF_FCI.to_vec());

        cmd.parse_response(&mut CommandContext::new(&mut ctx), &response)
            .unwrap();
        let header = ctx.file_header(0x07).unwrap();
        assert_eq!(header.ef_type, EfType::Linear);
        assert_eq!(header.record_size, 29);
        assert_eq!(header.records_number, 3);
        assert_eq!(header.lid, 0x2010);
    }

    #[test]
    fn test_missing_proprietary_information() {
        let mut ctx = context();
        let mut cmd = SelectFileCommand::by_lid(CardClass::Iso, 0x2010);
        let response = Response::success(hex!("6F038401AA").to_vec());
        let err = cmd
            .parse_response(&mut CommandContext::new(&mut ctx), &response)
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponseLength(_)));
    }
}
