use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 8] = b"CINDERWL";
const VERSION: u32 = 1;

/// Fixed-size header at the start of every WAL segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub wal_id: u64,
}

impl Header {
    pub fn new(wal_id: u64) -> Self {
        Header {
            magic: *MAGIC,
            version: VERSION,
            wal_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::Corruption("invalid WAL magic".into()));
        }
        if self.version != VERSION {
            return Err(Error::Corruption(format!(
                "unsupported WAL version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        (&mut buf[8..12])
            .write_u32::<BigEndian>(self.version)
            .unwrap();
        (&mut buf[12..20])
            .write_u64::<BigEndian>(self.wal_id)
            .unwrap();
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);

        let version = (&buf[8..12])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("WAL header version", e))?;
        let wal_id = (&buf[12..20])
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("WAL header id", e))?;

        let header = Self {
            magic,
            version,
            wal_id,
        };
        header.validate()?;
        Ok(header)
    }
}
