use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const HEADER_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"CINDERMF";
const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestHeader {
    pub magic: [u8; 8],
    pub version: u32,
    /// Milliseconds since the epoch when this manifest file was written.
    pub created_at: u64,
}

impl Default for ManifestHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestHeader {
    pub fn new() -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            magic: *MAGIC,
            version: VERSION,
            created_at,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::Corruption("invalid manifest magic number".into()));
        }
        if self.version != VERSION {
            return Err(Error::Corruption(format!(
                "unsupported manifest version: {}",
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
            .write_u64::<BigEndian>(self.created_at)
            .unwrap();
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let version = (&buf[8..12])
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("manifest version", e))?;
        let created_at = (&buf[12..20])
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("manifest timestamp", e))?;

        let header = Self {
            magic,
            version,
            created_at,
        };
        header.validate()?;
        Ok(header)
    }
}
